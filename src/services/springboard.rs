//! SpringBoard services client.
//!
//! Supplies the placeholder icons recorded per application in a backup's
//! Info.plist.

use crate::{DeviceConnection, DeviceError, DeviceService};

pub struct SpringBoardServicesClient {
    pub connection: DeviceConnection,
}

impl DeviceService for SpringBoardServicesClient {
    fn service_name() -> &'static str {
        "com.apple.springboardservices"
    }

    async fn connect(
        provider: &impl crate::provider::DeviceProvider,
    ) -> Result<Self, DeviceError> {
        let connection =
            super::start_service_connection(provider, Self::service_name(), false).await?;
        Ok(Self::new(connection))
    }
}

impl SpringBoardServicesClient {
    pub fn new(connection: DeviceConnection) -> Self {
        Self { connection }
    }

    /// Returns the PNG icon of an installed app
    pub async fn get_icon_pngdata(&mut self, bundle_id: &str) -> Result<Vec<u8>, DeviceError> {
        let mut req = plist::Dictionary::new();
        req.insert("command".into(), "getIconPNGData".into());
        req.insert("bundleId".into(), bundle_id.into());
        self.connection
            .send_plist(plist::Value::Dictionary(req))
            .await?;

        let mut res = self.connection.read_plist().await?;
        match res.remove("pngData") {
            Some(plist::Value::Data(data)) => Ok(data),
            _ => Err(DeviceError::UnexpectedResponse),
        }
    }
}
