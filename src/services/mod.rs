//! Per-service protocol clients.
//!
//! Each client here speaks one service's sub-protocol over a connection
//! lockdown activated for it. Only the services the backup exchange needs
//! are implemented.

pub mod afc;
pub mod diagnostics;
pub mod installation_proxy;
pub mod mobilebackup2;
pub mod notifications;
pub mod springboard;

use crate::lockdown::LockdownClient;
use crate::provider::DeviceProvider;
use crate::{DeviceConnection, DeviceError, DeviceService};

/// Shared activation path: start the service through an authenticated
/// lockdown session and open (and optionally TLS-wrap) the new stream.
pub(crate) async fn start_service_connection(
    provider: &impl DeviceProvider,
    service_name: &str,
    with_escrow_bag: bool,
) -> Result<DeviceConnection, DeviceError> {
    let mut lockdown = LockdownClient::connect(provider).await?;
    let pair_record = provider.get_pair_record().await?;
    lockdown.start_session(&pair_record).await?;

    let escrow = if with_escrow_bag {
        pair_record.escrow_bag.as_deref()
    } else {
        None
    };
    let (port, ssl) = lockdown.start_service(service_name, escrow).await?;
    lockdown.goodbye().await;

    let mut connection = provider.connect(port).await?;
    if ssl {
        connection.start_tls(&pair_record).await?;
    }
    Ok(connection)
}
