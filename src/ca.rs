//! Host identity generation for first-time pairing.
//!
//! The device hands us its RSA public key; we mint a root/host certificate
//! pair and a certificate over the device key, all signed by a fresh host
//! private key. Lockdown trusts whatever we send here once the user
//! accepts the trust dialog.

use std::str::FromStr;

use rsa::{
    pkcs1::DecodeRsaPublicKey,
    pkcs1v15::SigningKey,
    pkcs8::{EncodePrivateKey, LineEnding, SubjectPublicKeyInfo},
    RsaPrivateKey, RsaPublicKey,
};
use sha2::Sha256;
use x509_cert::{
    builder::{Builder, CertificateBuilder, Profile},
    der::EncodePem,
    name::Name,
    serial_number::SerialNumber,
    time::Validity,
    Certificate,
};

/// PEM-encoded output of one pairing certificate generation
#[derive(Clone, Debug)]
pub struct HostIdentity {
    pub host_cert: Vec<u8>,
    pub device_cert: Vec<u8>,
    pub private_key: Vec<u8>,
}

const TEN_YEARS: u64 = 10 * 365 * 24 * 60 * 60;

fn make_cert(
    signing_key: &RsaPrivateKey,
    public_key: &RsaPublicKey,
    common_name: Option<&str>,
) -> Result<Certificate, Box<dyn std::error::Error>> {
    let name = match common_name {
        Some(name) => Name::from_str(&format!("CN={name}"))?,
        None => Name::default(),
    };

    let validity = Validity::from_now(std::time::Duration::from_secs(TEN_YEARS))?;
    let signing_key = SigningKey::<Sha256>::new(signing_key.clone());
    let public_key = SubjectPublicKeyInfo::from_key(public_key.clone())?;

    let builder = CertificateBuilder::new(
        Profile::Root,
        SerialNumber::new(&[1])?,
        validity,
        name,
        public_key,
        &signing_key,
    )?;

    Ok(builder.build()?)
}

fn dump_cert(cert: &Certificate) -> Result<Vec<u8>, Box<dyn std::error::Error>> {
    Ok(cert.to_pem(LineEnding::LF)?.into_bytes())
}

/// Generates the host identity for a pairing record.
///
/// `device_public_key` is the PKCS#1 key returned by lockdown's
/// `DevicePublicKey` value; devices hand it out PEM-wrapped, older ones
/// as raw DER. Computationally heavy in a debug build.
pub(crate) fn generate_host_identity(
    device_public_key: &[u8],
) -> Result<HostIdentity, Box<dyn std::error::Error>> {
    let device_public_key = match std::str::from_utf8(device_public_key)
        .ok()
        .and_then(|pem| RsaPublicKey::from_pkcs1_pem(pem).ok())
    {
        Some(key) => key,
        None => RsaPublicKey::from_pkcs1_der(device_public_key)?,
    };

    let mut rng = rsa::rand_core::OsRng;
    let private_key = RsaPrivateKey::new(&mut rng, 2048)?;

    let host_public_key = RsaPublicKey::from(&private_key);
    let host_cert = make_cert(&private_key, &host_public_key, None)?;
    let device_cert = make_cert(&private_key, &device_public_key, Some("Device"))?;

    Ok(HostIdentity {
        host_cert: dump_cert(&host_cert)?,
        device_cert: dump_cert(&device_cert)?,
        private_key: private_key
            .to_pkcs8_pem(LineEnding::LF)?
            .as_bytes()
            .to_vec(),
    })
}
