use super::MetaStore;
use crate::Result;
use crate::model::CampaignOutcome;
use crate::model::OwnerLease;
use uuid::Uuid;

impl MetaStore {
    /// Try to take the owner lease for `node_id`.
    ///
    /// Succeeds when nobody holds a live lease, or when the live holder is
    /// this same node id (a restarted node re-campaigns under a new token and
    /// epoch, fencing out its previous incarnation).
    pub async fn try_campaign_owner(
        &self,
        node_id: &str,
        lease_ms: i64,
        now_ms: i64,
    ) -> Result<CampaignOutcome> {
        let mut tx = self.pool.begin_with("BEGIN IMMEDIATE").await?;
        let current = sqlx::query(
            r#"
SELECT owner_id, token, lease_until, epoch
FROM ddl_owner
WHERE id = 1
            "#,
        )
        .fetch_optional(&mut *tx)
        .await?
        .map(|row| OwnerLease::try_from_row(&row))
        .transpose()?;

        if let Some(lease) = current.as_ref()
            && lease.is_live(now_ms)
            && lease.owner_id != node_id
        {
            tx.commit().await?;
            return Ok(CampaignOutcome::HeldBy {
                owner_id: lease.owner_id.clone(),
                lease_until: lease.lease_until,
            });
        }

        let token = Uuid::new_v4().to_string();
        let epoch = current.map_or(1, |lease| lease.epoch + 1);
        let lease_until = now_ms.saturating_add(lease_ms.max(0));
        sqlx::query(
            r#"
INSERT INTO ddl_owner (id, owner_id, token, lease_until, epoch)
VALUES (1, ?, ?, ?, ?)
ON CONFLICT(id) DO UPDATE SET
    owner_id = excluded.owner_id,
    token = excluded.token,
    lease_until = excluded.lease_until,
    epoch = excluded.epoch
            "#,
        )
        .bind(node_id)
        .bind(token.as_str())
        .bind(lease_until)
        .bind(epoch)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(CampaignOutcome::Elected {
            token,
            epoch,
            lease_until,
        })
    }

    /// Extend a live lease. Returns `false` once the lease expired or moved to
    /// another token; an expired lease is never revived.
    pub async fn renew_owner_lease(
        &self,
        node_id: &str,
        token: &str,
        lease_ms: i64,
        now_ms: i64,
    ) -> Result<Option<i64>> {
        let lease_until = now_ms.saturating_add(lease_ms.max(0));
        let rows_affected = sqlx::query(
            r#"
UPDATE ddl_owner
SET lease_until = ?
WHERE id = 1 AND owner_id = ? AND token = ? AND lease_until > ?
            "#,
        )
        .bind(lease_until)
        .bind(node_id)
        .bind(token)
        .bind(now_ms)
        .execute(self.pool.as_ref())
        .await?
        .rows_affected();
        Ok((rows_affected > 0).then_some(lease_until))
    }

    /// Give the lease up so another node can win without waiting for expiry.
    pub async fn resign_owner(&self, token: &str) -> Result<bool> {
        let rows_affected = sqlx::query(
            r#"
DELETE FROM ddl_owner WHERE id = 1 AND token = ?
            "#,
        )
        .bind(token)
        .execute(self.pool.as_ref())
        .await?
        .rows_affected();
        Ok(rows_affected > 0)
    }

    pub async fn current_owner(&self) -> Result<Option<OwnerLease>> {
        sqlx::query(
            r#"
SELECT owner_id, token, lease_until, epoch
FROM ddl_owner
WHERE id = 1
            "#,
        )
        .fetch_optional(self.pool.as_ref())
        .await?
        .map(|row| OwnerLease::try_from_row(&row))
        .transpose()
    }
}
