//! Diagnostics relay client.
//!
//! Used by the backup flow for exactly one thing: asking MobileGestalt
//! whether a passcode is configured. Newer OS versions refuse to start a
//! backup on passcode-capable hardware without one.

use crate::{DeviceConnection, DeviceError, DeviceService};

pub struct DiagnosticsRelayClient {
    pub connection: DeviceConnection,
}

impl DeviceService for DiagnosticsRelayClient {
    fn service_name() -> &'static str {
        "com.apple.mobile.diagnostics_relay"
    }

    async fn connect(
        provider: &impl crate::provider::DeviceProvider,
    ) -> Result<Self, DeviceError> {
        let connection =
            super::start_service_connection(provider, Self::service_name(), false).await?;
        Ok(Self::new(connection))
    }
}

impl DiagnosticsRelayClient {
    pub fn new(connection: DeviceConnection) -> Self {
        Self { connection }
    }

    /// Queries MobileGestalt for the given keys.
    ///
    /// Some gestalt domains answer `DeprecatedInThisVersion` on recent OS
    /// versions; that surfaces as [`DeviceError::Deprecated`] and is the
    /// caller's decision to interpret.
    pub async fn mobilegestalt(
        &mut self,
        keys: &[&str],
    ) -> Result<Option<plist::Dictionary>, DeviceError> {
        let mut req = plist::Dictionary::new();
        req.insert("Request".into(), "MobileGestalt".into());
        req.insert(
            "MobileGestaltKeys".into(),
            plist::Value::Array(keys.iter().map(|k| plist::Value::from(*k)).collect()),
        );
        self.connection
            .send_plist(plist::Value::Dictionary(req))
            .await?;
        let mut res = self.connection.read_plist().await?;

        match res.get("Status").and_then(|x| x.as_string()) {
            Some("Success") => {}
            _ => return Err(DeviceError::UnexpectedResponse),
        }

        Ok(res
            .remove("Diagnostics")
            .and_then(|x| x.into_dictionary())
            .and_then(|mut x| x.remove("MobileGestalt"))
            .and_then(|x| x.into_dictionary()))
    }

    /// Sends the relay's goodbye request. Best effort.
    pub async fn goodbye(&mut self) -> Result<(), DeviceError> {
        let mut req = plist::Dictionary::new();
        req.insert("Request".into(), "Goodbye".into());
        self.connection
            .send_plist(plist::Value::Dictionary(req))
            .await?;
        let _ = self.connection.read_plist().await;
        Ok(())
    }
}
