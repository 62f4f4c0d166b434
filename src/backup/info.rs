//! Info.plist assembly.
//!
//! iTunes-compatible backups carry an Info.plist describing the device,
//! its installed applications, and a grab-bag of iTunes bookkeeping files
//! pulled off the device over AFC.

use std::collections::HashMap;
use std::time::SystemTime;

use log::debug;
use plist::{Dictionary, Value};

use crate::lockdown::LockdownClient;
use crate::services::afc::AfcClient;
use crate::services::installation_proxy::InstallationProxyClient;
use crate::services::springboard::SpringBoardServicesClient;
use crate::DeviceError;

/// Fixed list of iTunes bookkeeping files; whichever subset exists on the
/// device is embedded in Info.plist.
const ITUNES_FILES: [&str; 11] = [
    "ApertureAlbumPrefs",
    "IC-Info.sidb",
    "IC-Info.sidv",
    "PhotosFolderAlbums",
    "PhotosFolderName",
    "PhotosFolderPrefs",
    "VoiceMemos.plist",
    "iPhotoAlbumPrefs",
    "iTunesApplicationIDs",
    "iTunesPrefs",
    "iTunesPrefs.plist",
];

const ITUNES_CONTROL_DIR: &str = "/iTunes_Control/iTunes";
const IBOOKS_DATA_PATH: &str = "/Books/iBooksData2.plist";
const FALLBACK_ITUNES_VERSION: &str = "10.0.1";

/// Everything Info.plist assembly needs, gathered from the device
pub(crate) struct InfoSources {
    pub device_values: Dictionary,
    pub itunes_settings: Option<Dictionary>,
    pub min_itunes_version: Option<String>,
    pub apps: Vec<Dictionary>,
    pub icons: HashMap<String, Vec<u8>>,
    pub itunes_files: Vec<(String, Vec<u8>)>,
    pub ibooks_data: Option<Vec<u8>>,
}

/// Queries lockdown, the installation proxy, springboard and AFC for the
/// Info.plist inputs. Icon and file fetches are best effort.
pub(crate) async fn collect_info_sources(
    lockdown: &mut LockdownClient,
    installation_proxy: &mut InstallationProxyClient,
    springboard: Option<&mut SpringBoardServicesClient>,
    afc: &mut AfcClient,
) -> Result<InfoSources, DeviceError> {
    let device_values = match lockdown.get_value(None, None).await? {
        Value::Dictionary(d) => d,
        _ => return Err(DeviceError::UnexpectedResponse),
    };

    let itunes_settings = match lockdown.get_value(None, Some("com.apple.iTunes")).await {
        Ok(Value::Dictionary(d)) => Some(d),
        _ => None,
    };
    let min_itunes_version = lockdown
        .get_string_value("MinITunesVersion", Some("com.apple.mobile.iTunes"))
        .await
        .ok();

    let apps = installation_proxy
        .browse(
            Some("User"),
            &["CFBundleIdentifier", "ApplicationSINF", "iTunesMetadata"],
        )
        .await?;

    let mut icons = HashMap::new();
    if let Some(springboard) = springboard {
        for app in &apps {
            if let Some(bundle_id) = app.get("CFBundleIdentifier").and_then(|v| v.as_string()) {
                match springboard.get_icon_pngdata(bundle_id).await {
                    Ok(png) => {
                        icons.insert(bundle_id.to_string(), png);
                    }
                    Err(e) => debug!("No icon for {bundle_id}: {e}"),
                }
            }
        }
    }

    let mut itunes_files = Vec::new();
    for name in ITUNES_FILES {
        let path = format!("{ITUNES_CONTROL_DIR}/{name}");
        if let Ok(data) = afc.read_path(&path).await {
            itunes_files.push((name.to_string(), data));
        }
    }

    let ibooks_data = afc.read_path(IBOOKS_DATA_PATH).await.ok();

    Ok(InfoSources {
        device_values,
        itunes_settings,
        min_itunes_version,
        apps,
        icons,
        itunes_files,
        ibooks_data,
    })
}

/// Builds the Info.plist dictionary from gathered sources
pub(crate) fn assemble_info_plist(sources: InfoSources, udid: &str) -> Dictionary {
    let mut out = Dictionary::new();
    let root = &sources.device_values;

    let mut applications = Dictionary::new();
    let mut installed = Vec::new();
    for app in &sources.apps {
        let bundle_id = match app.get("CFBundleIdentifier").and_then(|v| v.as_string()) {
            Some(id) => id.to_string(),
            None => continue,
        };
        installed.push(Value::String(bundle_id.clone()));

        let mut entry = Dictionary::new();
        if let Some(sinf) = app.get("ApplicationSINF") {
            entry.insert("ApplicationSINF".into(), sinf.clone());
        }
        if let Some(meta) = app.get("iTunesMetadata") {
            entry.insert("iTunesMetadata".into(), meta.clone());
        }
        if let Some(png) = sources.icons.get(&bundle_id) {
            entry.insert("PlaceholderIcon".into(), Value::Data(png.clone()));
        }
        if !entry.is_empty() {
            applications.insert(bundle_id, Value::Dictionary(entry));
        }
    }
    out.insert("Applications".into(), Value::Dictionary(applications));
    out.insert("Installed Applications".into(), Value::Array(installed));

    for (source_key, target_key) in [
        ("BuildVersion", "Build Version"),
        ("DeviceName", "Device Name"),
        ("DeviceName", "Display Name"),
        ("IntegratedCircuitCardIdentity", "ICCID"),
        ("InternationalMobileEquipmentIdentity", "IMEI"),
        ("MobileEquipmentIdentifier", "MEID"),
        ("PhoneNumber", "Phone Number"),
        ("ProductType", "Product Type"),
        ("ProductVersion", "Product Version"),
        ("SerialNumber", "Serial Number"),
    ] {
        if let Some(value) = root.get(source_key) {
            out.insert(target_key.into(), value.clone());
        }
    }

    out.insert(
        "GUID".into(),
        uuid::Uuid::new_v4()
            .simple()
            .to_string()
            .to_uppercase()
            .into(),
    );
    out.insert(
        "Last Backup Date".into(),
        Value::Date(plist::Date::from(SystemTime::now())),
    );
    out.insert("Target Identifier".into(), udid.to_uppercase().into());
    out.insert("Target Type".into(), "Device".into());
    out.insert("Unique Identifier".into(), udid.to_uppercase().into());

    let mut files = Dictionary::new();
    for (name, data) in sources.itunes_files {
        files.insert(name, Value::Data(data));
    }
    out.insert("iTunes Files".into(), Value::Dictionary(files));

    if let Some(data) = sources.ibooks_data {
        out.insert("iBooks Data 2".into(), Value::Data(data));
    }

    out.insert(
        "iTunes Settings".into(),
        Value::Dictionary(sources.itunes_settings.unwrap_or_default()),
    );
    out.insert(
        "iTunes Version".into(),
        sources
            .min_itunes_version
            .unwrap_or_else(|| FALLBACK_ITUNES_VERSION.to_string())
            .into(),
    );

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_sources() -> InfoSources {
        let mut device_values = Dictionary::new();
        device_values.insert("BuildVersion".into(), "21G93".into());
        device_values.insert("DeviceName".into(), "Test iPhone".into());
        device_values.insert("ProductType".into(), "iPhone14,5".into());
        device_values.insert("ProductVersion".into(), "17.6".into());
        device_values.insert("SerialNumber".into(), "ABC123".into());

        let mut app = Dictionary::new();
        app.insert("CFBundleIdentifier".into(), "com.example.app".into());
        app.insert("ApplicationSINF".into(), Value::Data(vec![1, 2]));
        app.insert("iTunesMetadata".into(), Value::Data(vec![3, 4]));

        InfoSources {
            device_values,
            itunes_settings: None,
            min_itunes_version: None,
            apps: vec![app],
            icons: HashMap::from([("com.example.app".to_string(), vec![0x89, 0x50])]),
            itunes_files: vec![("iTunesPrefs".to_string(), vec![9])],
            ibooks_data: None,
        }
    }

    #[test]
    fn identity_keys_are_present() {
        let info = assemble_info_plist(sample_sources(), "abcdef0123456789abcdef0123456789abcdef01");

        assert_eq!(
            info.get("Target Identifier").and_then(|v| v.as_string()),
            Some("ABCDEF0123456789ABCDEF0123456789ABCDEF01")
        );
        assert_eq!(
            info.get("Target Type").and_then(|v| v.as_string()),
            Some("Device")
        );
        assert_eq!(
            info.get("Device Name").and_then(|v| v.as_string()),
            Some("Test iPhone")
        );
        assert_eq!(
            info.get("Display Name").and_then(|v| v.as_string()),
            Some("Test iPhone")
        );
        assert!(info.get("GUID").is_some());
        assert!(info.get("Last Backup Date").is_some());
        // fallback version when the device doesn't report one
        assert_eq!(
            info.get("iTunes Version").and_then(|v| v.as_string()),
            Some(FALLBACK_ITUNES_VERSION)
        );
    }

    #[test]
    fn applications_carry_sinf_metadata_and_icon() {
        let info = assemble_info_plist(sample_sources(), "UDID");
        let apps = info
            .get("Applications")
            .and_then(|v| v.as_dictionary())
            .unwrap();
        let entry = apps
            .get("com.example.app")
            .and_then(|v| v.as_dictionary())
            .unwrap();
        assert!(entry.get("ApplicationSINF").is_some());
        assert!(entry.get("iTunesMetadata").is_some());
        assert!(entry.get("PlaceholderIcon").is_some());

        let installed = info
            .get("Installed Applications")
            .and_then(|v| v.as_array())
            .unwrap();
        assert_eq!(installed.len(), 1);

        let files = info
            .get("iTunes Files")
            .and_then(|v| v.as_dictionary())
            .unwrap();
        assert!(files.get("iTunesPrefs").is_some());
    }
}
