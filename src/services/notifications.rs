//! Notification proxy client.
//!
//! The backup flow posts the iTunes sync lifecycle notifications through
//! this service and observes the device-side cancel/suspend/resume
//! requests.
//!
//! Posted during a backup:
//! - `com.apple.itunes-mobdev.syncWillStart`
//! - `com.apple.itunes-mobdev.syncLockRequest`
//! - `com.apple.itunes-mobdev.syncDidStart`
//! - `com.apple.itunes-mobdev.syncDidFinish`
//!
//! Observed:
//! - `com.apple.itunes-client.syncCancelRequest`
//! - `com.apple.itunes-client.syncSuspendRequest`
//! - `com.apple.itunes-client.syncResumeRequest`

use plist::Value;

use crate::{DeviceConnection, DeviceError, DeviceService};

pub const SYNC_WILL_START: &str = "com.apple.itunes-mobdev.syncWillStart";
pub const SYNC_LOCK_REQUEST: &str = "com.apple.itunes-mobdev.syncLockRequest";
pub const SYNC_DID_START: &str = "com.apple.itunes-mobdev.syncDidStart";
pub const SYNC_DID_FINISH: &str = "com.apple.itunes-mobdev.syncDidFinish";

pub const SYNC_CANCEL_REQUEST: &str = "com.apple.itunes-client.syncCancelRequest";
pub const SYNC_SUSPEND_REQUEST: &str = "com.apple.itunes-client.syncSuspendRequest";
pub const SYNC_RESUME_REQUEST: &str = "com.apple.itunes-client.syncResumeRequest";

#[derive(Debug)]
pub struct NotificationProxyClient {
    pub connection: DeviceConnection,
}

impl DeviceService for NotificationProxyClient {
    fn service_name() -> &'static str {
        "com.apple.mobile.notification_proxy"
    }

    async fn connect(
        provider: &impl crate::provider::DeviceProvider,
    ) -> Result<Self, DeviceError> {
        let connection =
            super::start_service_connection(provider, Self::service_name(), false).await?;
        Ok(Self::new(connection))
    }
}

impl NotificationProxyClient {
    pub fn new(connection: DeviceConnection) -> Self {
        Self { connection }
    }

    /// Posts a notification to the device. Fire and forget; the proxy does
    /// not acknowledge posts.
    pub async fn post(&mut self, name: &str) -> Result<(), DeviceError> {
        let mut req = plist::Dictionary::new();
        req.insert("Command".into(), "PostNotification".into());
        req.insert("Name".into(), name.into());
        self.connection.send_plist(Value::Dictionary(req)).await
    }

    /// Registers interest in a notification; events arrive through
    /// [`Self::receive`].
    pub async fn observe(&mut self, name: &str) -> Result<(), DeviceError> {
        let mut req = plist::Dictionary::new();
        req.insert("Command".into(), "ObserveNotification".into());
        req.insert("Name".into(), name.into());
        self.connection.send_plist(Value::Dictionary(req)).await
    }

    /// Waits for the next relayed notification and returns its name
    pub async fn receive(&mut self) -> Result<String, DeviceError> {
        let res = self.connection.read_plist().await?;
        match res.get("Command").and_then(|c| c.as_string()) {
            Some("RelayNotification") => match res.get("Name").and_then(|n| n.as_string()) {
                Some(name) => Ok(name.to_string()),
                None => Err(DeviceError::UnexpectedResponse),
            },
            _ => Err(DeviceError::UnexpectedResponse),
        }
    }

    /// Tells the proxy to shut down. Best effort.
    pub async fn shutdown(&mut self) -> Result<(), DeviceError> {
        let mut req = plist::Dictionary::new();
        req.insert("Command".into(), "Shutdown".into());
        self.connection.send_plist(Value::Dictionary(req)).await?;
        let _ = self.connection.read_plist().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn post_sends_command() {
        let (client, mut server) = tokio::io::duplex(4096);
        let device = tokio::spawn(async move {
            let mut len = [0u8; 4];
            server.read_exact(&mut len).await.unwrap();
            let mut body = vec![0; u32::from_be_bytes(len) as usize];
            server.read_exact(&mut body).await.unwrap();
            plist::from_bytes::<plist::Dictionary>(&body).unwrap()
        });

        let mut np = NotificationProxyClient::new(DeviceConnection::new(Box::new(client), "test"));
        np.post(SYNC_WILL_START).await.unwrap();

        let req = device.await.unwrap();
        assert_eq!(
            req.get("Command").and_then(|v| v.as_string()),
            Some("PostNotification")
        );
        assert_eq!(
            req.get("Name").and_then(|v| v.as_string()),
            Some(SYNC_WILL_START)
        );
    }
}
