//! Mobilebackup2 service client.
//!
//! Speaks the DeviceLink envelope plus mobilebackup2's own message layer:
//! a `Hello` protocol-version exchange after the DeviceLink handshake, then
//! free-form request dictionaries wrapped in `DLMessageProcessMessage`.
//! The long-running conversation itself is driven by [`crate::backup`].

use log::{debug, warn};
use plist::{Dictionary, Value};

use crate::devicelink::{self, DeviceLink};
use crate::{DeviceError, DeviceService};

/// Protocol versions this client offers during `Hello`
const SUPPORTED_VERSIONS: [f64; 2] = [2.0, 2.1];

pub struct Mobilebackup2Client {
    pub link: DeviceLink,
    /// Version negotiated by `Hello`, 0.0 before the exchange
    pub protocol_version: f64,
}

impl DeviceService for Mobilebackup2Client {
    fn service_name() -> &'static str {
        "com.apple.mobilebackup2"
    }

    /// Activates the service (with the pairing record's escrow bag, so the
    /// device can unlock protected domains), performs the DeviceLink
    /// handshake and the Hello exchange.
    async fn connect(
        provider: &impl crate::provider::DeviceProvider,
    ) -> Result<Self, DeviceError> {
        let connection =
            super::start_service_connection(provider, Self::service_name(), true).await?;
        let mut link = DeviceLink::new(connection);
        link.version_exchange().await?;

        let mut client = Self {
            link,
            protocol_version: 0.0,
        };
        client.hello().await?;
        Ok(client)
    }
}

impl Mobilebackup2Client {
    /// Wraps an already-handshaken DeviceLink without re-running Hello.
    /// Useful when the caller drives the handshake itself.
    pub fn new(link: DeviceLink) -> Self {
        Self {
            link,
            protocol_version: 0.0,
        }
    }

    /// Performs the mobilebackup2 version exchange
    pub async fn hello(&mut self) -> Result<(), DeviceError> {
        debug!("Starting mobilebackup2 version exchange");
        let mut hello = Dictionary::new();
        hello.insert(
            "SupportedProtocolVersions".into(),
            Value::Array(
                SUPPORTED_VERSIONS
                    .iter()
                    .map(|v| Value::Real(*v))
                    .collect(),
            ),
        );
        self.send_message("Hello", hello).await?;

        let response = self.receive_process_message("Response").await?;
        if let Some(code) = response
            .get("ErrorCode")
            .and_then(|c| c.as_unsigned_integer())
        {
            if code != 0 {
                warn!("Version exchange failed with error code {code}");
                return Err(DeviceError::UnexpectedResponse);
            }
        }

        match response.get("ProtocolVersion").and_then(|v| v.as_real()) {
            Some(version) => {
                debug!("Negotiated mobilebackup2 protocol version {version}");
                self.protocol_version = version;
                Ok(())
            }
            None => {
                warn!("No protocol version in Hello response");
                Err(DeviceError::UnexpectedResponse)
            }
        }
    }

    /// Sends a `MessageName`-keyed dictionary in the process-message
    /// envelope.
    pub async fn send_message(
        &mut self,
        message_name: &str,
        mut body: Dictionary,
    ) -> Result<(), DeviceError> {
        body.insert("MessageName".into(), message_name.into());
        debug!("Sending mobilebackup2 message {message_name}");
        self.link.send_process_message(body).await
    }

    /// Sends a request with target/source identifiers, the shape used by
    /// `Backup`, `Restore`, `Info` and friends.
    pub async fn send_request(
        &mut self,
        request: &str,
        target_identifier: &str,
        source_identifier: &str,
        options: Option<Dictionary>,
    ) -> Result<(), DeviceError> {
        let mut body = Dictionary::new();
        body.insert("TargetIdentifier".into(), target_identifier.into());
        body.insert("SourceIdentifier".into(), source_identifier.into());
        if let Some(options) = options {
            body.insert("Options".into(), Value::Dictionary(options));
        }
        self.send_message(request, body).await
    }

    /// Receives one process message, optionally checking its MessageName
    async fn receive_process_message(
        &mut self,
        expected: &str,
    ) -> Result<Dictionary, DeviceError> {
        let (tag, value) = self.link.receive().await?;
        if tag != devicelink::PROCESS_MESSAGE {
            warn!("Expected {}, got {tag}", devicelink::PROCESS_MESSAGE);
            return Err(DeviceError::UnexpectedResponse);
        }
        let arr = devicelink::as_array(&value)?;
        let dict = match arr.get(1) {
            Some(Value::Dictionary(d)) => d.clone(),
            _ => return Err(DeviceError::UnexpectedResponse),
        };
        if !expected.is_empty() {
            match dict.get("MessageName").and_then(|m| m.as_string()) {
                Some(name) if name == expected => {}
                other => {
                    warn!("Expected message '{expected}', got {other:?}");
                    return Err(DeviceError::UnexpectedResponse);
                }
            }
        }
        Ok(dict)
    }

    /// Sends the DeviceLink close signal. Best effort on teardown.
    pub async fn disconnect(&mut self) -> Result<(), DeviceError> {
        self.link.disconnect().await?;
        debug!("Disconnected from backup service");
        Ok(())
    }
}
