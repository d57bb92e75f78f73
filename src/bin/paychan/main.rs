use std::{fs, io, path::PathBuf, process, time::Duration};

use paychan::{
    channel::{self, Channel, Snapshot},
    config,
    keys::PublicKey,
};
use snafu::{ResultExt, Snafu};
use structopt::StructOpt;
use tracing::{subscriber, Level};
use tracing_fmt::FmtSubscriber;

#[derive(Debug, StructOpt)]
enum Commands {
    Config(CommandsConfig),
    Snapshot(CommandsSnapshot),
}

#[derive(Debug, StructOpt)]
enum CommandsConfig {
    New {
        network_passphrase: String,
        channel_account: PublicKey,
        #[structopt(long, default_value = "3600")]
        max_open_expiry: u64,
    },
    GetSigner,
    GetChannelAccount,
}

#[derive(Debug, StructOpt)]
enum CommandsSnapshot {
    /// Print the state of the channel snapshot read on stdin
    Show {
        #[structopt(long, parse(from_os_str))]
        config: PathBuf,
    },
}

#[derive(Debug, Snafu)]
enum SnapshotError {
    #[snafu(display("open config: {}", source))]
    OpenConfig { source: io::Error },
    #[snafu(display("read config: {}", source))]
    ReadConfig { source: config::Error },
    #[snafu(display("read snapshot: {}", source))]
    ReadSnapshot { source: io::Error },
    #[snafu(display("restore: {}", source))]
    Restore { source: channel::Error },
}

#[derive(Debug, Snafu)]
enum Error {
    #[snafu(display("logging: {}", source))]
    Logging {
        source: tracing::dispatcher::SetGlobalDefaultError,
    },
    #[snafu(display("config: {}", source))]
    Config { source: config::Error },
    #[snafu(display("snapshot: {}", source))]
    ShowSnapshot { source: SnapshotError },
}

fn config(cmd: CommandsConfig) -> Result<(), Error> {
    match cmd {
        CommandsConfig::New {
            network_passphrase,
            channel_account,
            max_open_expiry,
        } => config::Config::generate(
            network_passphrase,
            Duration::from_secs(max_open_expiry),
            channel_account,
        )
        .write(io::stdout())
        .context(Config),
        CommandsConfig::GetSigner => {
            let config = config::Config::read(io::stdin()).context(Config)?;

            println!("{}", config.signer().public());

            Ok(())
        }
        CommandsConfig::GetChannelAccount => {
            let config = config::Config::read(io::stdin()).context(Config)?;

            println!("{}", config.channel_account());

            Ok(())
        }
    }
}

fn show_snapshot(config_path: PathBuf) -> Result<(), SnapshotError> {
    let file = fs::File::open(config_path).context(OpenConfig)?;
    let config = config::Config::read(file).context(ReadConfig)?;

    let mut encoded = Vec::new();
    io::Read::read_to_end(&mut io::stdin(), &mut encoded).context(ReadSnapshot)?;
    let snapshot = Snapshot::from_bytes(&encoded).context(Restore)?;
    let channel = Channel::from_snapshot(config.signer(), snapshot).context(Restore)?;

    println!("state: {:?}", channel.state());
    println!("initiator: {}", channel.is_initiator());
    println!("balance: {}", channel.balance());
    println!("next iteration: {}", channel.next_iteration_number());
    for (name, account) in [
        ("local", channel.local_channel_account()),
        ("remote", channel.remote_channel_account()),
    ] {
        println!(
            "{} account: {} sequence {} holding {}",
            name, account.address, account.sequence_number, account.balance
        );
    }
    if let Some(cursor) = channel.last_ingested_cursor() {
        println!("last ingested: {}", cursor);
    }

    Ok(())
}

fn main() {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    let ret = subscriber::set_global_default(subscriber)
        .context(Logging)
        .and_then(|()| match Commands::from_args() {
            Commands::Config(cmd) => config(cmd),
            Commands::Snapshot(CommandsSnapshot::Show { config }) => {
                show_snapshot(config).context(ShowSnapshot)
            }
        });

    if let Err(err) = ret {
        eprintln!("error running cmd: {}", err);
        process::exit(1);
    }
}
