//! Registration of this process's membership record.

use roost_coord::{CoordClient, CoordResult};
use tracing::info;

use crate::member::MemberRecord;

/// Create this process's ephemeral, sequentially-numbered membership
/// record under `membership_path`, creating missing ancestors as needed.
///
/// The record needs no explicit cleanup: the coordination service removes
/// it when the owning session terminates, gracefully or by expiry.
pub async fn register(
    client: &CoordClient,
    membership_path: &str,
) -> CoordResult<MemberRecord> {
    client.ensure(membership_path).await?;
    let path = client.create_sequential(membership_path, true).await?;
    let record = MemberRecord::from_path(membership_path, &path);
    info!(id = %record.id, path = %record.path, "registered membership record");
    Ok(record)
}
