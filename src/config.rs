//! Configuration of a participant, stored as TOML.

use std::{fmt, io, time::Duration};

use serde::{Deserialize, Serialize};
use snafu::{ensure, ResultExt, Snafu};

use crate::{
    channel,
    keys::{KeyPair, PublicKey},
};

/// Network the channel lives on
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct ConfigNetwork {
    /// Passphrase the transactions are signed for
    pub passphrase: String,
    /// Furthest in the future an open can expire, in seconds
    pub max_open_expiry: u64,
}

/// Keys of this participant
#[derive(Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ConfigKeys {
    /// Channel account
    #[serde(with = "hex")]
    pub channel_account: [u8; 32],
    /// Seed of the signer
    #[serde(with = "hex")]
    pub signer: [u8; 32],
}

impl fmt::Debug for ConfigKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigKeys")
            .field("channel_account", &PublicKey(self.channel_account))
            .field("signer", &KeyPair::from_seed(self.signer).public())
            .finish()
    }
}

/// Configuration of a participant
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct Config {
    /// Network
    pub network: ConfigNetwork,
    /// Keys
    pub keys: ConfigKeys,
}

/// Errors of the participant configuration
#[derive(Debug, Snafu)]
pub enum Error {
    /// Configuration could not be serialized
    #[snafu(display("encode participant config: {}", source))]
    Encode {
        /// Cause
        source: toml::ser::Error,
    },
    /// Configuration could not be written out
    #[snafu(display("write participant config: {}", source))]
    Write {
        /// Cause
        source: io::Error,
    },
    /// Configuration could not be read in
    #[snafu(display("read participant config: {}", source))]
    Read {
        /// Cause
        source: io::Error,
    },
    /// Configuration is not valid TOML for a participant
    #[snafu(display("parse participant config: {}", source))]
    Parse {
        /// Cause
        source: toml::de::Error,
    },
    /// The signer controls the channel account alone
    #[snafu(display("signer {} is the channel account itself", signer))]
    SignerIsChannelAccount {
        /// Offending key
        signer: PublicKey,
    },
}

impl Config {
    /// Fresh configuration with a random signer
    pub fn generate(passphrase: String, max_open_expiry: Duration, channel_account: PublicKey) -> Self {
        Self {
            network: ConfigNetwork {
                passphrase,
                max_open_expiry: max_open_expiry.as_secs(),
            },
            keys: ConfigKeys {
                channel_account: channel_account.0,
                signer: KeyPair::random().seed(),
            },
        }
    }

    /// Read a configuration, checking its signer is not the channel account
    ///
    /// The signer is added next to the channel account key, whose weight then drops to zero.
    pub fn read(mut reader: impl io::Read) -> Result<Self, Error> {
        let mut buffer = String::new();
        reader.read_to_string(&mut buffer).context(Read)?;

        let config: Self = toml::from_str(&buffer).context(Parse)?;
        let signer = config.signer().public();
        ensure!(
            signer != config.channel_account(),
            SignerIsChannelAccount { signer }
        );

        Ok(config)
    }

    /// Write the configuration as TOML
    pub fn write(&self, mut writer: impl io::Write) -> Result<(), Error> {
        let encoded = toml::to_vec(self).context(Encode)?;

        writer.write_all(&encoded).context(Write)
    }

    /// Channel account of this participant
    pub fn channel_account(&self) -> PublicKey {
        PublicKey(self.keys.channel_account)
    }

    /// Signer of this participant
    pub fn signer(&self) -> KeyPair {
        KeyPair::from_seed(self.keys.signer)
    }

    /// Channel configuration, once the other participant introduced itself
    pub fn channel_config(
        &self,
        remote_channel_account: PublicKey,
        remote_signer: PublicKey,
    ) -> channel::Config {
        channel::Config {
            network_passphrase: self.network.passphrase.clone(),
            max_open_expiry: Duration::from_secs(self.network.max_open_expiry),
            local_channel_account: self.channel_account(),
            remote_channel_account,
            local_signer: self.signer(),
            remote_signer,
        }
    }
}
