//! Lockdown service client.
//!
//! Lockdown is the control daemon every device exposes on TCP 62078. It
//! answers typed value queries, performs pairing and session negotiation,
//! and activates the per-feature services the rest of this crate talks to.
//! The wire format is a big-endian length prefix followed by one plist;
//! strict request/response, one outstanding request at a time.

use std::time::Duration;

use log::{debug, warn};
use plist::Value;

use crate::pair_record::PairRecord;
use crate::provider::DeviceProvider;
use crate::{DeviceConnection, DeviceError, DeviceService};

/// Progress of a pairing attempt, reported at each transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingState {
    /// Minting the host key and certificates
    GeneratingHostIdentity,
    /// The trust dialog is showing on the device
    AwaitingUserConsent,
    /// The device requires its passcode to be entered first
    RequiresPassword,
    /// The device rejected our host id; retrying with a fresh identity
    RestartingAfterInvalidHostId,
    /// The record was accepted by the device
    Succeeded,
}

/// Client for the lockdown control daemon
pub struct LockdownClient {
    pub connection: DeviceConnection,
    session_id: Option<String>,
    ssl_enabled: bool,
}

impl DeviceService for LockdownClient {
    fn service_name() -> &'static str {
        "com.apple.mobile.lockdown"
    }

    /// Connects to lockdown and verifies the endpoint identifies itself
    async fn connect(provider: &impl DeviceProvider) -> Result<Self, DeviceError> {
        let connection = provider.connect(Self::LOCKDOWN_PORT).await?;
        let mut client = Self::new(connection);
        client.query_type().await?;
        Ok(client)
    }
}

impl LockdownClient {
    /// The TCP port lockdown listens on, on every device
    pub const LOCKDOWN_PORT: u16 = 62078;

    const PAIR_RETRY_FLOOR: Duration = Duration::from_millis(200);
    const PAIR_RETRY_BUDGET: Duration = Duration::from_secs(30);

    pub fn new(connection: DeviceConnection) -> Self {
        Self {
            connection,
            session_id: None,
            ssl_enabled: false,
        }
    }

    /// The session id returned by `StartSession`, if one is active
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn ssl_enabled(&self) -> bool {
        self.ssl_enabled
    }

    /// Initial handshake: the endpoint must identify as lockdown
    pub async fn query_type(&mut self) -> Result<(), DeviceError> {
        let mut req = plist::Dictionary::new();
        req.insert("Label".into(), self.connection.label().to_string().into());
        req.insert("Request".into(), "QueryType".into());
        self.connection.send_plist(Value::Dictionary(req)).await?;
        let res = self.connection.read_plist().await?;
        match res.get("Type").and_then(|t| t.as_string()) {
            Some(t) if t == Self::service_name() => Ok(()),
            other => {
                warn!("Port {} identified as {other:?}", Self::LOCKDOWN_PORT);
                Err(DeviceError::NotLockdown)
            }
        }
    }

    /// Retrieves one value, or the full device dictionary when both `key`
    /// and `domain` are `None`.
    pub async fn get_value(
        &mut self,
        key: Option<&str>,
        domain: Option<&str>,
    ) -> Result<Value, DeviceError> {
        let mut req = plist::Dictionary::new();
        req.insert("Label".into(), self.connection.label().to_string().into());
        req.insert("Request".into(), "GetValue".into());
        if let Some(key) = key {
            req.insert("Key".into(), key.into());
        }
        if let Some(domain) = domain {
            req.insert("Domain".into(), domain.into());
        }
        self.connection.send_plist(Value::Dictionary(req)).await?;
        let mut res = self.connection.read_plist().await?;
        res.remove("Value").ok_or(DeviceError::UnexpectedResponse)
    }

    /// Convenience accessor for string-typed values
    pub async fn get_string_value(
        &mut self,
        key: &str,
        domain: Option<&str>,
    ) -> Result<String, DeviceError> {
        match self.get_value(Some(key), domain).await? {
            Value::String(s) => Ok(s),
            _ => Err(DeviceError::UnexpectedResponse),
        }
    }

    /// Sets a value, optionally within a domain
    pub async fn set_value(
        &mut self,
        key: impl Into<String>,
        value: Value,
        domain: Option<&str>,
    ) -> Result<(), DeviceError> {
        let mut req = plist::Dictionary::new();
        req.insert("Label".into(), self.connection.label().to_string().into());
        req.insert("Request".into(), "SetValue".into());
        req.insert("Key".into(), key.into().into());
        req.insert("Value".into(), value);
        if let Some(domain) = domain {
            req.insert("Domain".into(), domain.into());
        }
        self.connection.send_plist(Value::Dictionary(req)).await?;
        self.connection.read_plist().await?;
        Ok(())
    }

    /// Starts a session with the device.
    ///
    /// If the device requests SSL, the stream is upgraded in place to TLS
    /// using the host identity from the pairing record.
    pub async fn start_session(&mut self, pair_record: &PairRecord) -> Result<(), DeviceError> {
        let mut req = plist::Dictionary::new();
        req.insert("Label".into(), self.connection.label().to_string().into());
        req.insert("Request".into(), "StartSession".into());
        req.insert("HostID".into(), pair_record.host_id.clone().into());
        req.insert("SystemBUID".into(), pair_record.system_buid.clone().into());
        self.connection.send_plist(Value::Dictionary(req)).await?;

        let res = self.connection.read_plist().await?;
        self.session_id = res
            .get("SessionID")
            .and_then(|s| s.as_string())
            .map(ToString::to_string);

        let ssl = res
            .get("EnableSessionSSL")
            .and_then(|e| e.as_boolean())
            .unwrap_or(false);
        if ssl {
            self.connection.start_tls(pair_record).await?;
            self.ssl_enabled = true;
        }
        Ok(())
    }

    /// Asks lockdown to start a service, returning its port and whether the
    /// new connection must be TLS-upgraded before use.
    pub async fn start_service(
        &mut self,
        identifier: impl Into<String>,
        escrow_bag: Option<&[u8]>,
    ) -> Result<(u16, bool), DeviceError> {
        let identifier = identifier.into();
        let mut req = plist::Dictionary::new();
        req.insert("Label".into(), self.connection.label().to_string().into());
        req.insert("Request".into(), "StartService".into());
        req.insert("Service".into(), identifier.clone().into());
        if let Some(bag) = escrow_bag {
            req.insert("EscrowBag".into(), plist::Value::Data(bag.to_vec()));
        }
        self.connection.send_plist(Value::Dictionary(req)).await?;
        let res = match self.connection.read_plist().await {
            Ok(res) => res,
            Err(e) => {
                warn!("StartService {identifier} failed: {e}");
                return Err(DeviceError::ServiceStartFailed(identifier));
            }
        };

        // Over USB the SSL flag may be absent entirely
        let ssl = res
            .get("EnableServiceSSL")
            .and_then(|s| s.as_boolean())
            .unwrap_or(false);

        match res
            .get("Port")
            .and_then(|p| p.as_unsigned_integer())
        {
            Some(port) if port <= u16::MAX as u64 => Ok((port as u16, ssl)),
            _ => {
                warn!("StartService response carried no usable port");
                Err(DeviceError::ServiceStartFailed(identifier))
            }
        }
    }

    /// Performs first-time pairing with the device.
    ///
    /// Mints a host identity over the device's public key and submits the
    /// record, looping through the trust dialog with bounded backoff.
    /// `system_buid` comes from the multiplexer's `ReadBUID`. The returned
    /// record is NOT persisted; the caller saves it through the multiplexer.
    pub async fn pair(
        &mut self,
        system_buid: impl Into<String>,
        mut progress: impl FnMut(PairingState),
    ) -> Result<PairRecord, DeviceError> {
        let system_buid = system_buid.into();

        let pub_key = self.get_value(Some("DevicePublicKey"), None).await?;
        let pub_key = match pub_key.as_data() {
            Some(p) => p.to_vec(),
            None => {
                warn!("Did not get public key data response");
                return Err(DeviceError::UnexpectedResponse);
            }
        };

        let wifi_mac = match self.get_value(Some("WiFiAddress"), None).await {
            Ok(Value::String(w)) => Some(w),
            _ => None,
        };

        let mut restarted = false;
        loop {
            progress(PairingState::GeneratingHostIdentity);
            let host_id = uuid::Uuid::new_v4().to_string().to_uppercase();
            let identity = crate::ca::generate_host_identity(&pub_key)
                .map_err(|e| DeviceError::InternalError(e.to_string()))?;

            let mut record = plist::Dictionary::new();
            record.insert("DevicePublicKey".into(), plist::Value::Data(pub_key.clone()));
            record.insert(
                "DeviceCertificate".into(),
                plist::Value::Data(identity.device_cert.clone()),
            );
            record.insert(
                "HostCertificate".into(),
                plist::Value::Data(identity.host_cert.clone()),
            );
            record.insert(
                "RootCertificate".into(),
                plist::Value::Data(identity.host_cert.clone()),
            );
            record.insert("HostID".into(), host_id.clone().into());
            record.insert("SystemBUID".into(), system_buid.clone().into());
            if let Some(mac) = &wifi_mac {
                record.insert("WiFiMACAddress".into(), mac.clone().into());
            }

            let mut options = plist::Dictionary::new();
            options.insert("ExtendedPairingErrors".into(), true.into());

            let mut req = plist::Dictionary::new();
            req.insert("Label".into(), self.connection.label().to_string().into());
            req.insert("Request".into(), "Pair".into());
            req.insert("PairRecord".into(), Value::Dictionary(record.clone()));
            req.insert("ProtocolVersion".into(), "2".into());
            req.insert("PairingOptions".into(), Value::Dictionary(options));

            let mut delay = Self::PAIR_RETRY_FLOOR;
            let mut waited = Duration::ZERO;
            loop {
                self.connection
                    .send_plist(Value::Dictionary(req.clone()))
                    .await?;
                match self.connection.read_plist().await {
                    Ok(res) => {
                        record.insert(
                            "HostPrivateKey".into(),
                            plist::Value::Data(identity.private_key.clone()),
                        );
                        record.insert(
                            "RootPrivateKey".into(),
                            plist::Value::Data(identity.private_key.clone()),
                        );
                        if let Some(escrow) = res.get("EscrowBag").and_then(|e| e.as_data()) {
                            record.insert(
                                "EscrowBag".into(),
                                plist::Value::Data(escrow.to_vec()),
                            );
                        }
                        progress(PairingState::Succeeded);
                        return PairRecord::from_value(&Value::Dictionary(record));
                    }
                    Err(DeviceError::PairingDialogResponsePending) => {
                        progress(PairingState::AwaitingUserConsent);
                    }
                    Err(DeviceError::PasswordProtected) => {
                        progress(PairingState::RequiresPassword);
                    }
                    Err(DeviceError::InvalidHostId) if !restarted => {
                        // Device holds a stale record for this host id;
                        // restart once with a fresh identity
                        restarted = true;
                        progress(PairingState::RestartingAfterInvalidHostId);
                        break;
                    }
                    Err(e) => return Err(e),
                }

                if waited >= Self::PAIR_RETRY_BUDGET {
                    return Err(DeviceError::PairingDialogResponsePending);
                }
                tokio::time::sleep(delay).await;
                waited += delay;
                delay = (delay * 2).min(Duration::from_secs(5));
            }
        }
    }

    /// Politely ends the lockdown conversation and closes the socket.
    /// Best effort; errors are discarded.
    pub async fn goodbye(mut self) {
        let mut req = plist::Dictionary::new();
        req.insert("Label".into(), self.connection.label().to_string().into());
        req.insert("Request".into(), "Goodbye".into());
        if let Err(e) = self.connection.send_plist(Value::Dictionary(req)).await {
            debug!("Goodbye failed: {e}");
        }
    }
}

impl From<DeviceConnection> for LockdownClient {
    fn from(connection: DeviceConnection) -> Self {
        Self::new(connection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn read_request(
        socket: &mut (impl tokio::io::AsyncRead + Unpin),
    ) -> plist::Dictionary {
        let mut len = [0u8; 4];
        socket.read_exact(&mut len).await.unwrap();
        let mut body = vec![0; u32::from_be_bytes(len) as usize];
        socket.read_exact(&mut body).await.unwrap();
        plist::from_bytes(&body).unwrap()
    }

    async fn write_reply(
        socket: &mut (impl tokio::io::AsyncWrite + Unpin),
        dict: plist::Dictionary,
    ) {
        let mut buf = Vec::new();
        Value::Dictionary(dict).to_writer_binary(&mut buf).unwrap();
        socket
            .write_all(&(buf.len() as u32).to_be_bytes())
            .await
            .unwrap();
        socket.write_all(&buf).await.unwrap();
    }

    fn client_for(stream: tokio::io::DuplexStream) -> LockdownClient {
        LockdownClient::new(DeviceConnection::new(Box::new(stream), "test"))
    }

    #[tokio::test]
    async fn query_type_accepts_lockdown() {
        let (client, mut server) = tokio::io::duplex(16 * 1024);
        tokio::spawn(async move {
            let req = read_request(&mut server).await;
            assert_eq!(
                req.get("Request").and_then(|v| v.as_string()),
                Some("QueryType")
            );
            let mut reply = plist::Dictionary::new();
            reply.insert("Type".into(), "com.apple.mobile.lockdown".into());
            write_reply(&mut server, reply).await;
        });

        let mut client = client_for(client);
        client.query_type().await.unwrap();
    }

    #[tokio::test]
    async fn query_type_rejects_other_services() {
        let (client, mut server) = tokio::io::duplex(16 * 1024);
        tokio::spawn(async move {
            let _ = read_request(&mut server).await;
            let mut reply = plist::Dictionary::new();
            reply.insert("Type".into(), "com.apple.springboardservices".into());
            write_reply(&mut server, reply).await;
        });

        let mut client = client_for(client);
        assert!(matches!(
            client.query_type().await,
            Err(DeviceError::NotLockdown)
        ));
    }

    #[tokio::test]
    async fn get_value_returns_typed_value() {
        let (client, mut server) = tokio::io::duplex(16 * 1024);
        tokio::spawn(async move {
            let req = read_request(&mut server).await;
            assert_eq!(req.get("Key").and_then(|v| v.as_string()), Some("ProductType"));
            let mut reply = plist::Dictionary::new();
            reply.insert("Value".into(), "iPhone14,5".into());
            write_reply(&mut server, reply).await;
        });

        let mut client = client_for(client);
        let value = client.get_value(Some("ProductType"), None).await.unwrap();
        assert_eq!(value.as_string(), Some("iPhone14,5"));
    }

    #[tokio::test]
    async fn deprecated_is_a_distinct_error() {
        let (client, mut server) = tokio::io::duplex(16 * 1024);
        tokio::spawn(async move {
            let _ = read_request(&mut server).await;
            let mut reply = plist::Dictionary::new();
            reply.insert("Error".into(), "DeprecatedInThisVersion".into());
            write_reply(&mut server, reply).await;
        });

        let mut client = client_for(client);
        assert!(matches!(
            client.get_value(None, Some("com.apple.mobile.MobileGestalt")).await,
            Err(DeviceError::Deprecated)
        ));
    }

    #[tokio::test]
    async fn start_session_without_ssl() {
        let (client, mut server) = tokio::io::duplex(16 * 1024);
        tokio::spawn(async move {
            let req = read_request(&mut server).await;
            assert_eq!(req.get("HostID").and_then(|v| v.as_string()), Some("HOST-1"));
            assert_eq!(
                req.get("SystemBUID").and_then(|v| v.as_string()),
                Some("BUID-1")
            );
            let mut reply = plist::Dictionary::new();
            reply.insert("SessionID".into(), "session-abc".into());
            reply.insert("EnableSessionSSL".into(), false.into());
            write_reply(&mut server, reply).await;
        });

        // A record with unparseable certs is fine as long as SSL stays off
        let record = test_record();
        let mut client = client_for(client);
        client.start_session(&record).await.unwrap();
        assert_eq!(client.session_id(), Some("session-abc"));
        assert!(!client.ssl_enabled());
    }

    #[tokio::test]
    async fn start_service_returns_port_and_ssl() {
        let (client, mut server) = tokio::io::duplex(16 * 1024);
        tokio::spawn(async move {
            let req = read_request(&mut server).await;
            assert_eq!(
                req.get("Service").and_then(|v| v.as_string()),
                Some("com.apple.mobilebackup2")
            );
            assert!(req.get("EscrowBag").is_some());
            let mut reply = plist::Dictionary::new();
            reply.insert("Port".into(), 49152.into());
            reply.insert("EnableServiceSSL".into(), true.into());
            write_reply(&mut server, reply).await;
        });

        let mut client = client_for(client);
        let (port, ssl) = client
            .start_service("com.apple.mobilebackup2", Some(b"bag"))
            .await
            .unwrap();
        assert_eq!(port, 49152);
        assert!(ssl);
    }

    #[tokio::test]
    async fn start_service_failure_names_the_service() {
        let (client, mut server) = tokio::io::duplex(16 * 1024);
        tokio::spawn(async move {
            let _ = read_request(&mut server).await;
            let mut reply = plist::Dictionary::new();
            reply.insert("Error".into(), "InvalidService".into());
            write_reply(&mut server, reply).await;
        });

        let mut client = client_for(client);
        match client.start_service("com.apple.bogus", None).await {
            Err(DeviceError::ServiceStartFailed(name)) => assert_eq!(name, "com.apple.bogus"),
            other => panic!("expected ServiceStartFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn pair_retries_through_trust_dialog() {
        use rsa::pkcs1::EncodeRsaPublicKey;

        let mut rng = rsa::rand_core::OsRng;
        let device_key = rsa::RsaPrivateKey::new(&mut rng, 1024).unwrap();
        let device_pub_pem = rsa::RsaPublicKey::from(&device_key)
            .to_pkcs1_pem(rsa::pkcs8::LineEnding::LF)
            .unwrap();

        let (client, mut server) = tokio::io::duplex(256 * 1024);
        let device = tokio::spawn(async move {
            let mut pair_attempts = 0;
            loop {
                let req = read_request(&mut server).await;
                match req.get("Request").and_then(|v| v.as_string()) {
                    Some("GetValue") => {
                        let mut reply = plist::Dictionary::new();
                        match req.get("Key").and_then(|v| v.as_string()) {
                            Some("DevicePublicKey") => {
                                reply.insert(
                                    "Value".into(),
                                    Value::Data(device_pub_pem.as_bytes().to_vec()),
                                );
                            }
                            Some("WiFiAddress") => {
                                reply.insert("Value".into(), "aa:bb:cc:dd:ee:ff".into());
                            }
                            other => panic!("unexpected GetValue {other:?}"),
                        }
                        write_reply(&mut server, reply).await;
                    }
                    Some("Pair") => {
                        pair_attempts += 1;
                        let mut reply = plist::Dictionary::new();
                        if pair_attempts == 1 {
                            reply.insert("Error".into(), "PairingDialogResponsePending".into());
                        } else {
                            let record = req
                                .get("PairRecord")
                                .and_then(|v| v.as_dictionary())
                                .expect("pair request carries a record");
                            assert!(record.get("HostID").is_some());
                            assert!(record.get("HostCertificate").is_some());
                            assert_eq!(
                                record.get("SystemBUID").and_then(|v| v.as_string()),
                                Some("SYSTEM-BUID")
                            );
                            reply.insert("EscrowBag".into(), Value::Data(vec![1, 2, 3]));
                        }
                        write_reply(&mut server, reply).await;
                        if pair_attempts == 2 {
                            return;
                        }
                    }
                    other => panic!("unexpected request {other:?}"),
                }
            }
        });

        let mut client = client_for(client);
        let mut states = Vec::new();
        let record = client
            .pair("SYSTEM-BUID", |s| states.push(s))
            .await
            .unwrap();

        assert_eq!(record.system_buid, "SYSTEM-BUID");
        assert_eq!(record.escrow_bag.as_deref(), Some(&[1u8, 2, 3][..]));
        assert!(states.contains(&PairingState::AwaitingUserConsent));
        assert_eq!(states.last(), Some(&PairingState::Succeeded));
        device.await.unwrap();
    }

    fn test_record() -> PairRecord {
        use rustls::pki_types::CertificateDer;
        PairRecord {
            device_certificate: CertificateDer::from(vec![0u8; 4]),
            host_private_key: Vec::new(),
            host_certificate: CertificateDer::from(vec![0u8; 4]),
            root_private_key: Vec::new(),
            root_certificate: CertificateDer::from(vec![0u8; 4]),
            system_buid: "BUID-1".into(),
            host_id: "HOST-1".into(),
            escrow_bag: None,
            wifi_mac_address: None,
            udid: None,
        }
    }
}
