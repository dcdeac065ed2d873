use crate::Result;
use sqlx::Row;
use sqlx::sqlite::SqliteRow;

/// The single cluster-wide owner record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerLease {
    pub owner_id: String,
    pub token: String,
    pub lease_until: i64,
    pub epoch: i64,
}

impl OwnerLease {
    pub fn is_live(&self, now_ms: i64) -> bool {
        self.lease_until > now_ms
    }

    pub(crate) fn try_from_row(row: &SqliteRow) -> Result<Self> {
        Ok(Self {
            owner_id: row.try_get("owner_id")?,
            token: row.try_get("token")?,
            lease_until: row.try_get("lease_until")?,
            epoch: row.try_get("epoch")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CampaignOutcome {
    Elected {
        token: String,
        epoch: i64,
        lease_until: i64,
    },
    HeldBy {
        owner_id: String,
        lease_until: i64,
    },
}

/// Schema version last observed by a registered node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeVersion {
    pub node_id: String,
    pub version: i64,
    pub lease_until: i64,
}

impl NodeVersion {
    pub(crate) fn try_from_row(row: &SqliteRow) -> Result<Self> {
        Ok(Self {
            node_id: row.try_get("node_id")?,
            version: row.try_get("version")?,
            lease_until: row.try_get("lease_until")?,
        })
    }
}
