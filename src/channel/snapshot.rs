use std::time::Duration;

use serde::{Deserialize, Serialize};
use snafu::{ensure, ResultExt};

use super::{Channel, ChannelAccount, Decode, Encode, Result, SnapshotSignerMismatch};
use crate::{
    agreement::{CloseEnvelope, OpenEnvelope},
    keys::{KeyPair, PublicKey},
    ledger,
};

/// Everything needed to resume a channel, the local secret key aside
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Network the transactions are signed for
    pub network_passphrase: String,
    /// Furthest in the future an open can expire
    pub max_open_expiry: Duration,
    /// Signer of this participant
    pub local_signer: PublicKey,
    /// Signer of the other participant
    pub remote_signer: PublicKey,
    /// Channel account of this participant
    pub local_channel_account: ChannelAccount,
    /// Channel account of the other participant
    pub remote_channel_account: ChannelAccount,
    /// Agreed open
    pub open_agreement: Option<OpenEnvelope>,
    /// Whether the formation was seen on the ledger
    pub open_executed_and_validated: bool,
    /// Latest close agreement signed by both participants
    pub latest_authorized_close_agreement: Option<CloseEnvelope>,
    /// Close agreement in progress
    pub latest_unauthorized_close_agreement: Option<CloseEnvelope>,
    /// Where to resume ingestion from
    pub last_ingested_cursor: Option<String>,
}

impl Snapshot {
    /// Encode to bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        ledger::encode(self).context(Encode)
    }

    /// Decode from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        ledger::decode(bytes).context(Decode)
    }
}

impl Channel {
    /// Capture the current state
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            network_passphrase: self.network_passphrase.clone(),
            max_open_expiry: self.max_open_expiry,
            local_signer: self.local_signer.public(),
            remote_signer: self.remote_signer,
            local_channel_account: self.local_channel_account.clone(),
            remote_channel_account: self.remote_channel_account.clone(),
            open_agreement: self.open_agreement.clone(),
            open_executed_and_validated: self.open_executed_and_validated,
            latest_authorized_close_agreement: self.latest_authorized_close_agreement.clone(),
            latest_unauthorized_close_agreement: self.latest_unauthorized_close_agreement.clone(),
            last_ingested_cursor: self.last_ingested_cursor.clone(),
        }
    }

    /// Resume a channel from `snapshot`, signing with `local_signer`
    pub fn from_snapshot(local_signer: KeyPair, snapshot: Snapshot) -> Result<Self> {
        ensure!(
            local_signer.public() == snapshot.local_signer,
            SnapshotSignerMismatch {
                signer: snapshot.local_signer
            }
        );

        let mut channel = Self::new(super::Config {
            network_passphrase: snapshot.network_passphrase,
            max_open_expiry: snapshot.max_open_expiry,
            local_channel_account: snapshot.local_channel_account.address,
            remote_channel_account: snapshot.remote_channel_account.address,
            local_signer,
            remote_signer: snapshot.remote_signer,
        });
        channel.local_channel_account = snapshot.local_channel_account;
        channel.remote_channel_account = snapshot.remote_channel_account;
        channel.open_agreement = snapshot.open_agreement;
        channel.open_executed_and_validated = snapshot.open_executed_and_validated;
        channel.latest_authorized_close_agreement = snapshot.latest_authorized_close_agreement;
        channel.latest_unauthorized_close_agreement = snapshot.latest_unauthorized_close_agreement;
        channel.last_ingested_cursor = snapshot.last_ingested_cursor;

        Ok(channel)
    }
}
