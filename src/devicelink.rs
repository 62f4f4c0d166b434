//! DeviceLink message envelope.
//!
//! Services in the DeviceLink family (mobilebackup2 among them) wrap every
//! message in a plist array whose first element is a `DLMessage*` tag
//! string. A connection starts with a version exchange and a device-ready
//! confirmation; afterwards both sides exchange tagged arrays until one
//! sends `DLMessageDisconnect`.

use std::time::Duration;

use log::{debug, warn};
use plist::Value;

use crate::{DeviceConnection, DeviceError};

pub const VERSION_EXCHANGE: &str = "DLMessageVersionExchange";
pub const DEVICE_READY: &str = "DLMessageDeviceReady";
pub const PROCESS_MESSAGE: &str = "DLMessageProcessMessage";
pub const STATUS_RESPONSE: &str = "DLMessageStatusResponse";
pub const DISCONNECT: &str = "DLMessageDisconnect";

/// Placeholder the protocol uses for absent string parameters
pub const EMPTY_PARAMETER: &str = "___EmptyParameterString___";

/// One DeviceLink conversation over a service connection.
///
/// Holds no state beyond the negotiated version pair; its lifetime equals
/// the service connection's.
pub struct DeviceLink {
    connection: DeviceConnection,
    version: Option<(u64, u64)>,
}

impl DeviceLink {
    pub fn new(connection: DeviceConnection) -> Self {
        Self {
            connection,
            version: None,
        }
    }

    /// The `{major, minor}` pair negotiated at start
    pub fn version(&self) -> Option<(u64, u64)> {
        self.version
    }

    /// Raw access to the underlying stream, for sub-protocols that frame
    /// their own bytes (file transfer chunks).
    pub fn connection_mut(&mut self) -> &mut DeviceConnection {
        &mut self.connection
    }

    pub fn into_connection(self) -> DeviceConnection {
        self.connection
    }

    /// Performs the opening handshake.
    ///
    /// Waits for `DLMessageVersionExchange {major, minor}`, confirms with
    /// `DLVersionsOk`, then waits for `DLMessageDeviceReady`. Anything else
    /// is fatal for the connection.
    pub async fn version_exchange(&mut self) -> Result<(u64, u64), DeviceError> {
        debug!("Starting DeviceLink version exchange");
        let (tag, msg) = self.receive().await?;
        if tag != VERSION_EXCHANGE {
            warn!("Expected {VERSION_EXCHANGE}, got {tag}");
            return Err(DeviceError::UnexpectedResponse);
        }
        let arr = as_array(&msg)?;
        let major = arr
            .get(1)
            .and_then(|v| v.as_unsigned_integer())
            .ok_or(DeviceError::UnexpectedResponse)?;
        let minor = arr
            .get(2)
            .and_then(|v| v.as_unsigned_integer())
            .unwrap_or(0);

        self.send_array(vec![
            Value::String(VERSION_EXCHANGE.into()),
            Value::String("DLVersionsOk".into()),
            Value::Integer(major.into()),
        ])
        .await?;

        let (tag, _) = self.receive().await?;
        if tag != DEVICE_READY {
            warn!("Expected {DEVICE_READY}, got {tag}");
            return Err(DeviceError::UnexpectedResponse);
        }

        debug!("DeviceLink ready, device version {major}.{minor}");
        self.version = Some((major, minor));
        Ok((major, minor))
    }

    /// Receives one tagged array, returning the tag and the full array value
    pub async fn receive(&mut self) -> Result<(String, Value), DeviceError> {
        let value = self.connection.read_plist_value().await?;
        match &value {
            Value::Array(arr) => match arr.first() {
                Some(Value::String(tag)) => Ok((tag.clone(), value)),
                _ => {
                    warn!("DeviceLink array does not start with a tag string");
                    Err(DeviceError::UnexpectedResponse)
                }
            },
            _ => {
                warn!("DeviceLink message is not an array");
                Err(DeviceError::UnexpectedResponse)
            }
        }
    }

    /// Receives with a deadline; a timeout surfaces as
    /// [`DeviceError::ReceiveTimeout`] so callers can treat it as transient.
    pub async fn receive_timeout(
        &mut self,
        timeout: Duration,
    ) -> Result<(String, Value), DeviceError> {
        match tokio::time::timeout(timeout, self.receive()).await {
            Ok(res) => res,
            Err(_) => Err(DeviceError::ReceiveTimeout),
        }
    }

    /// Sends a raw tagged array
    pub async fn send_array(&mut self, array: Vec<Value>) -> Result<(), DeviceError> {
        self.connection.send_plist(Value::Array(array)).await
    }

    /// Sends an application payload wrapped in `DLMessageProcessMessage`
    pub async fn send_process_message(
        &mut self,
        message: plist::Dictionary,
    ) -> Result<(), DeviceError> {
        self.send_array(vec![
            Value::String(PROCESS_MESSAGE.into()),
            Value::Dictionary(message),
        ])
        .await
    }

    /// Sends a `DLMessageStatusResponse` array
    pub async fn send_status_response(
        &mut self,
        status_code: i64,
        status_string: Option<&str>,
        payload: Option<Value>,
    ) -> Result<(), DeviceError> {
        self.send_array(vec![
            Value::String(STATUS_RESPONSE.into()),
            Value::Integer(status_code.into()),
            Value::String(status_string.unwrap_or(EMPTY_PARAMETER).into()),
            payload.unwrap_or_else(|| Value::Dictionary(plist::Dictionary::new())),
        ])
        .await
    }

    /// Sends the close signal. Best effort on teardown paths.
    pub async fn disconnect(&mut self) -> Result<(), DeviceError> {
        self.send_array(vec![
            Value::String(DISCONNECT.into()),
            Value::String(EMPTY_PARAMETER.into()),
        ])
        .await
    }
}

pub(crate) fn as_array(value: &Value) -> Result<&Vec<Value>, DeviceError> {
    match value {
        Value::Array(arr) => Ok(arr),
        _ => Err(DeviceError::UnexpectedResponse),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    pub(crate) async fn write_array(
        socket: &mut (impl tokio::io::AsyncWrite + Unpin),
        array: Vec<Value>,
    ) {
        let mut buf = Vec::new();
        Value::Array(array).to_writer_binary(&mut buf).unwrap();
        socket
            .write_all(&(buf.len() as u32).to_be_bytes())
            .await
            .unwrap();
        socket.write_all(&buf).await.unwrap();
    }

    pub(crate) async fn read_array(
        socket: &mut (impl tokio::io::AsyncRead + Unpin),
    ) -> Vec<Value> {
        let mut len = [0u8; 4];
        socket.read_exact(&mut len).await.unwrap();
        let mut body = vec![0; u32::from_be_bytes(len) as usize];
        socket.read_exact(&mut body).await.unwrap();
        match plist::from_bytes::<Value>(&body).unwrap() {
            Value::Array(arr) => arr,
            other => panic!("expected array, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn version_exchange_round_trip() {
        let (client, mut server) = tokio::io::duplex(16 * 1024);
        let device = tokio::spawn(async move {
            write_array(
                &mut server,
                vec![
                    Value::String(VERSION_EXCHANGE.into()),
                    Value::Integer(400u64.into()),
                    Value::Integer(0u64.into()),
                ],
            )
            .await;

            let reply = read_array(&mut server).await;
            assert_eq!(reply[0].as_string(), Some(VERSION_EXCHANGE));
            assert_eq!(reply[1].as_string(), Some("DLVersionsOk"));
            assert_eq!(reply[2].as_unsigned_integer(), Some(400));

            write_array(&mut server, vec![Value::String(DEVICE_READY.into())]).await;
        });

        let mut link = DeviceLink::new(DeviceConnection::new(Box::new(client), "test"));
        let (major, minor) = link.version_exchange().await.unwrap();
        assert_eq!((major, minor), (400, 0));
        assert_eq!(link.version(), Some((400, 0)));
        device.await.unwrap();
    }

    #[tokio::test]
    async fn unexpected_tag_fails_handshake() {
        let (client, mut server) = tokio::io::duplex(16 * 1024);
        tokio::spawn(async move {
            write_array(&mut server, vec![Value::String(DISCONNECT.into())]).await;
        });

        let mut link = DeviceLink::new(DeviceConnection::new(Box::new(client), "test"));
        assert!(matches!(
            link.version_exchange().await,
            Err(DeviceError::UnexpectedResponse)
        ));
    }

    #[tokio::test]
    async fn status_response_shape() {
        let (client, mut server) = tokio::io::duplex(16 * 1024);
        let device = tokio::spawn(async move { read_array(&mut server).await });

        let mut link = DeviceLink::new(DeviceConnection::new(Box::new(client), "test"));
        link.send_status_response(0, None, None).await.unwrap();

        let arr = device.await.unwrap();
        assert_eq!(arr[0].as_string(), Some(STATUS_RESPONSE));
        assert_eq!(arr[1].as_signed_integer(), Some(0));
        assert_eq!(arr[2].as_string(), Some(EMPTY_PARAMETER));
        assert!(matches!(arr[3], Value::Dictionary(_)));
    }

    #[tokio::test]
    async fn receive_timeout_is_transient() {
        let (client, _server) = tokio::io::duplex(16 * 1024);
        let mut link = DeviceLink::new(DeviceConnection::new(Box::new(client), "test"));
        let err = link
            .receive_timeout(Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }
}
