//! Boot option selection for PXE and iPXE clients.
//!
//! A pure function of the request's vendor/user class and the per-server
//! overrides; the handler turns the directive into DHCP options.

use tracing::warn;

/// Service-wide boot settings and defaults.
#[derive(Debug, Clone, Default)]
pub struct BootDefaults {
    pub enable_ipxe: bool,

    /// PXE boot file served over TFTP (option 67 / BOOTP `file`).
    pub pxe_boot_image: String,

    /// iPXE boot script URL (HTTP).
    pub ipxe_boot_script: String,

    /// TFTP server name advertised in option 66.
    pub tftp_server_name: String,
}

/// Boot instruction selected for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootDirective {
    /// Direct an iPXE client to chainload its boot script.
    IpxeScript { script_url: String },

    /// Direct a plain PXE client to a boot image on a TFTP server.
    PxeImage { boot_file: String, tftp_server: String },
}

/// Whether the request comes from a PXE-capable client seeking a boot server.
pub fn is_pxe_client(vendor_class: Option<&str>) -> bool {
    vendor_class
        .map(|value| value.starts_with("PXEClient:"))
        .unwrap_or(false)
}

/// Whether the request comes from an iPXE client.
pub fn is_ipxe_client(user_class: Option<&str>) -> bool {
    user_class == Some("iPXE")
}

/// Select boot options for a request.
///
/// Returns `None` when boot options do not apply to this client, or when
/// neither a per-server override nor a service default is configured; the
/// reply still goes out without boot options in that case.
pub fn resolve(
    defaults: &BootDefaults,
    vendor_class: Option<&str>,
    user_class: Option<&str>,
    server_pxe_image: Option<&str>,
    server_ipxe_script: Option<&str>,
) -> Option<BootDirective> {
    if !defaults.enable_ipxe || !is_pxe_client(vendor_class) {
        return None;
    }

    if is_ipxe_client(user_class) {
        let script_url = effective(server_ipxe_script, &defaults.ipxe_boot_script, "iPXE boot script")?;
        return Some(BootDirective::IpxeScript { script_url });
    }

    let boot_file = effective(server_pxe_image, &defaults.pxe_boot_image, "PXE boot image")?;
    Some(BootDirective::PxeImage {
        boot_file,
        tftp_server: defaults.tftp_server_name.clone(),
    })
}

/// Per-server override if non-empty, otherwise the service default.
fn effective(override_value: Option<&str>, default_value: &str, what: &str) -> Option<String> {
    match override_value {
        Some(value) if !value.is_empty() => Some(value.to_string()),
        _ if !default_value.is_empty() => Some(default_value.to_string()),
        _ => {
            warn!("Client requested boot options but no {} is configured.", what);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults() -> BootDefaults {
        BootDefaults {
            enable_ipxe: true,
            pxe_boot_image: "undionly.kpxe".to_string(),
            ipxe_boot_script: "http://x/boot.ipxe".to_string(),
            tftp_server_name: "10.0.0.10".to_string(),
        }
    }

    const PXE_VENDOR_CLASS: Option<&str> = Some("PXEClient:Arch:00000:UNDI:002001");

    #[test]
    fn test_client_classification() {
        assert!(is_pxe_client(PXE_VENDOR_CLASS));
        assert!(!is_pxe_client(Some("PXEClient")));
        assert!(!is_pxe_client(Some("MSFT 5.0")));
        assert!(!is_pxe_client(None));

        assert!(is_ipxe_client(Some("iPXE")));
        assert!(!is_ipxe_client(Some("gPXE")));
        assert!(!is_ipxe_client(None));
    }

    #[test]
    fn test_non_pxe_client_gets_nothing() {
        assert_eq!(resolve(&defaults(), None, None, None, None), None);
        assert_eq!(resolve(&defaults(), Some("MSFT 5.0"), None, None, None), None);
    }

    #[test]
    fn test_disabled_ipxe_gets_nothing() {
        let mut config = defaults();
        config.enable_ipxe = false;
        assert_eq!(resolve(&config, PXE_VENDOR_CLASS, Some("iPXE"), None, None), None);
    }

    #[test]
    fn test_ipxe_client_gets_boot_script() {
        let directive = resolve(&defaults(), PXE_VENDOR_CLASS, Some("iPXE"), None, None).unwrap();
        assert_eq!(
            directive,
            BootDirective::IpxeScript {
                script_url: "http://x/boot.ipxe".to_string()
            }
        );
    }

    #[test]
    fn test_pxe_client_gets_boot_image() {
        let directive = resolve(&defaults(), PXE_VENDOR_CLASS, None, None, None).unwrap();
        assert_eq!(
            directive,
            BootDirective::PxeImage {
                boot_file: "undionly.kpxe".to_string(),
                tftp_server: "10.0.0.10".to_string(),
            }
        );
    }

    #[test]
    fn test_server_overrides_win() {
        let directive = resolve(&defaults(), PXE_VENDOR_CLASS, None, Some("custom.kpxe"), None).unwrap();
        assert_eq!(
            directive,
            BootDirective::PxeImage {
                boot_file: "custom.kpxe".to_string(),
                tftp_server: "10.0.0.10".to_string(),
            }
        );

        let directive = resolve(
            &defaults(),
            PXE_VENDOR_CLASS,
            Some("iPXE"),
            None,
            Some("http://x/server.ipxe"),
        )
        .unwrap();
        assert_eq!(
            directive,
            BootDirective::IpxeScript {
                script_url: "http://x/server.ipxe".to_string()
            }
        );
    }

    #[test]
    fn test_empty_override_falls_back_to_default() {
        let directive = resolve(&defaults(), PXE_VENDOR_CLASS, None, Some(""), None).unwrap();
        assert_eq!(
            directive,
            BootDirective::PxeImage {
                boot_file: "undionly.kpxe".to_string(),
                tftp_server: "10.0.0.10".to_string(),
            }
        );
    }

    #[test]
    fn test_nothing_configured_yields_none() {
        let mut config = defaults();
        config.pxe_boot_image = String::new();
        config.ipxe_boot_script = String::new();

        assert_eq!(resolve(&config, PXE_VENDOR_CLASS, None, None, None), None);
        assert_eq!(resolve(&config, PXE_VENDOR_CLASS, Some("iPXE"), None, None), None);
    }
}
