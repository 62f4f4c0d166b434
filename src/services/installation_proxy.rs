//! Installation proxy client.
//!
//! The backup engine browses installed user applications to assemble the
//! `Applications` and `Installed Applications` sections of Info.plist.

use plist::Value;

use crate::{DeviceConnection, DeviceError, DeviceService};

pub struct InstallationProxyClient {
    pub connection: DeviceConnection,
}

impl DeviceService for InstallationProxyClient {
    fn service_name() -> &'static str {
        "com.apple.mobile.installation_proxy"
    }

    async fn connect(
        provider: &impl crate::provider::DeviceProvider,
    ) -> Result<Self, DeviceError> {
        let connection =
            super::start_service_connection(provider, Self::service_name(), false).await?;
        Ok(Self::new(connection))
    }
}

impl InstallationProxyClient {
    pub fn new(connection: DeviceConnection) -> Self {
        Self { connection }
    }

    /// Browses installed applications.
    ///
    /// `application_type` filters by e.g. `"User"`; `return_attributes`
    /// limits which keys the device reports per app. The device streams
    /// results in batches terminated by a `Complete` status.
    pub async fn browse(
        &mut self,
        application_type: Option<&str>,
        return_attributes: &[&str],
    ) -> Result<Vec<plist::Dictionary>, DeviceError> {
        let mut options = plist::Dictionary::new();
        if let Some(t) = application_type {
            options.insert("ApplicationType".into(), t.into());
        }
        if !return_attributes.is_empty() {
            options.insert(
                "ReturnAttributes".into(),
                Value::Array(
                    return_attributes
                        .iter()
                        .map(|a| Value::from(*a))
                        .collect(),
                ),
            );
        }

        let mut req = plist::Dictionary::new();
        req.insert("Command".into(), "Browse".into());
        req.insert("ClientOptions".into(), Value::Dictionary(options));
        self.connection.send_plist(Value::Dictionary(req)).await?;

        let mut apps = Vec::new();
        loop {
            let res = self.connection.read_plist().await?;
            if let Some(Value::Array(list)) = res.get("CurrentList") {
                for entry in list {
                    if let Value::Dictionary(d) = entry {
                        apps.push(d.clone());
                    }
                }
            }
            match res.get("Status").and_then(|s| s.as_string()) {
                Some("Complete") => break,
                Some(_) => continue,
                None => return Err(DeviceError::UnexpectedResponse),
            }
        }
        Ok(apps)
    }
}
