//! Name construction and validation.
//!
//! Users hand in names without the `local.` domain; everything on the wire
//! is fully qualified.

use crate::error::{e_fmt, Error, Result};

const LOCAL_DOMAIN: &str = "local.";
const SUBTYPE_SEPARATOR: &str = "._sub.";

/// Max length of a single DNS label.
const MAX_LABEL_LEN: usize = 63;

/// Max length of a domain name, RFC 1035 section 3.1.
const MAX_NAME_LEN: usize = 255;

/// Service names are at most 15 characters, RFC 6763 section 7.2.
const MAX_SERVICE_NAME_LEN: usize = 15;

/// The meta-query name for service type enumeration, RFC 6763 section 9.
pub(crate) const SERVICES_META_QUERY: &str = "_services._dns-sd._udp.local.";

/// `office` -> `office.local.`
pub fn local_host_full_name(host_name: &str) -> String {
    format!("{}.{}", host_name, LOCAL_DOMAIN)
}

/// `_printer._tcp.` -> `_printer._tcp.local.`
pub fn local_service_full_name(service_name: &str) -> String {
    format!("{}{}", service_name, LOCAL_DOMAIN)
}

/// (`office`, `_printer._tcp.`) -> `office._printer._tcp.local.`
pub fn local_instance_full_name(instance_name: &str, service_name: &str) -> String {
    format!("{}.{}{}", instance_name, service_name, LOCAL_DOMAIN)
}

/// (`_color`, `_printer._tcp.`) -> `_color._sub._printer._tcp.local.`
pub fn local_subtype_full_name(subtype: &str, service_name: &str) -> String {
    format!(
        "{}{}{}{}",
        subtype, SUBTYPE_SEPARATOR, service_name, LOCAL_DOMAIN
    )
}

/// Returns the instance label of `instance_full_name` if it belongs to
/// `service_full_name`.
pub(crate) fn instance_from_full_name(
    instance_full_name: &str,
    service_full_name: &str,
) -> Option<String> {
    let prefix_len = instance_full_name
        .len()
        .checked_sub(service_full_name.len() + 1)?;
    if prefix_len == 0
        || instance_full_name.as_bytes()[prefix_len] != b'.'
        || !instance_full_name[prefix_len + 1..].eq_ignore_ascii_case(service_full_name)
    {
        return None;
    }
    Some(instance_full_name[..prefix_len].to_string())
}

/// Splits `_color._sub._printer._tcp.local.` into the subtype `_color` and
/// the service full name. Returns `None` for names without a subtype.
pub(crate) fn split_subtype_full_name(name: &str) -> Option<(&str, &str)> {
    let lower = name.to_ascii_lowercase();
    let pos = lower.find(SUBTYPE_SEPARATOR)?;
    Some((&name[..pos], &name[pos + SUBTYPE_SEPARATOR.len()..]))
}

/// Validates a service name such as `_printer._tcp.`.
pub(crate) fn check_service_name(service_name: &str) -> Result<()> {
    let Some(name) = service_name
        .strip_suffix("._tcp.")
        .or_else(|| service_name.strip_suffix("._udp."))
    else {
        return Err(Error::InvalidName(format!(
            "service {} must end with '._tcp.' or '._udp.'",
            service_name
        )));
    };

    let Some(name) = name.strip_prefix('_') else {
        return Err(Error::InvalidName(format!(
            "service {} must start with '_'",
            service_name
        )));
    };

    if name.is_empty() || name.len() > MAX_SERVICE_NAME_LEN {
        return Err(Error::InvalidName(format!(
            "service name {} must be 1 to {} bytes",
            name, MAX_SERVICE_NAME_LEN
        )));
    }

    if name.contains('.') || name.contains("--") {
        return Err(Error::InvalidName(format!(
            "service name {} must be one label without '--'",
            name
        )));
    }

    if name.starts_with('-') || name.ends_with('-') {
        return Err(Error::InvalidName(format!(
            "service name {} may not start or end with '-'",
            name
        )));
    }

    if !name.chars().any(|c| c.is_ascii_alphabetic()) {
        return Err(Error::InvalidName(format!(
            "service name {} must contain at least one letter",
            name
        )));
    }

    Ok(())
}

/// Validates a single label: 1 to 63 bytes, no dots.
fn check_label(kind: &str, label: &str) -> Result<()> {
    if label.is_empty() || label.len() > MAX_LABEL_LEN {
        return Err(Error::InvalidName(format!(
            "{} '{}' must be 1 to {} bytes",
            kind, label, MAX_LABEL_LEN
        )));
    }
    if label.contains('.') {
        return Err(Error::InvalidName(format!(
            "{} '{}' must not contain '.'",
            kind, label
        )));
    }
    Ok(())
}

/// Validates a host name such as `office`.
pub(crate) fn check_host_name(host_name: &str) -> Result<()> {
    check_label("host name", host_name)?;
    if local_host_full_name(host_name).len() > MAX_NAME_LEN {
        return Err(e_fmt!("Hostname length must be <= {} bytes", MAX_NAME_LEN));
    }
    Ok(())
}

/// Validates an instance name. Spaces are fine, dots are not: names go on
/// the wire without escaping.
pub(crate) fn check_instance_name(instance_name: &str) -> Result<()> {
    check_label("instance", instance_name)
}

/// Validates a subtype such as `_color`.
pub(crate) fn check_subtype_name(subtype: &str) -> Result<()> {
    check_label("subtype", subtype)?;
    match subtype.strip_prefix('_') {
        Some(name) if !name.is_empty() => Ok(()),
        _ => Err(Error::InvalidName(format!(
            "subtype '{}' must be '_' followed by at least one byte",
            subtype
        ))),
    }
}

pub fn is_valid_host_name(host_name: &str) -> bool {
    check_host_name(host_name).is_ok()
}

pub fn is_valid_service_name(service_name: &str) -> bool {
    check_service_name(service_name).is_ok()
}

pub fn is_valid_instance_name(instance_name: &str) -> bool {
    check_instance_name(instance_name).is_ok()
}

pub fn is_valid_subtype_name(subtype: &str) -> bool {
    check_subtype_name(subtype).is_ok()
}

/// Returns a new host name based on the `original` to avoid conflicts.
/// If the name already contains a hyphenated number, increments that number.
///
/// Examples:
/// - `foo` becomes `foo-2`
/// - `foo-2` becomes `foo-3`
pub(crate) fn host_name_change(original: &str) -> String {
    // check if there is already a `-<num>` suffix
    if let Some(hyphen_pos) = original.rfind('-') {
        if let Ok(number) = original[hyphen_pos + 1..].parse::<u32>() {
            let base_name = &original[..hyphen_pos];
            return format!("{}-{}", base_name, number + 1);
        }
    }
    format!("{}-2", original)
}

/// The alternate host name for services that must not share the primary
/// host's records: `<host>-<4 hex digits of an FNV-1a hash of the host>`.
pub(crate) fn alt_host_name(host_name: &str) -> String {
    const FNV_OFFSET: u32 = 0x811c_9dc5;
    const FNV_PRIME: u32 = 0x0100_0193;

    let hash = host_name
        .to_ascii_lowercase()
        .bytes()
        .fold(FNV_OFFSET, |hash, b| (hash ^ b as u32).wrapping_mul(FNV_PRIME));
    let folded = (hash >> 16) ^ (hash & 0xffff);

    // Keep the result a valid label.
    let mut base = host_name.to_string();
    while base.len() > MAX_LABEL_LEN - 5 {
        base.pop();
    }
    format!("{}-{:04x}", base, folded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn test_full_names() {
        assert_eq!(local_host_full_name("office"), "office.local.");
        assert_eq!(local_service_full_name("_ipp._tcp."), "_ipp._tcp.local.");
        assert_eq!(
            local_instance_full_name("My Printer", "_ipp._tcp."),
            "My Printer._ipp._tcp.local."
        );
        assert_eq!(
            local_subtype_full_name("_color", "_ipp._tcp."),
            "_color._sub._ipp._tcp.local."
        );
    }

    #[test]
    fn test_instance_from_full_name() {
        assert_eq!(
            instance_from_full_name("My Printer._ipp._tcp.local.", "_IPP._tcp.local."),
            Some("My Printer".to_string())
        );
        assert_eq!(
            instance_from_full_name("x._other._tcp.local.", "_ipp._tcp.local."),
            None
        );
        assert_eq!(instance_from_full_name("._ipp._tcp.local.", "_ipp._tcp.local."), None);
        assert_eq!(instance_from_full_name("_ipp._tcp.local.", "_ipp._tcp.local."), None);
    }

    #[test]
    fn test_split_subtype() {
        assert_eq!(
            split_subtype_full_name("_color._sub._ipp._tcp.local."),
            Some(("_color", "_ipp._tcp.local."))
        );
        assert_eq!(split_subtype_full_name("_ipp._tcp.local."), None);
    }

    #[test]
    fn test_service_name_validation() {
        assert!(is_valid_service_name("_ipp._tcp."));
        assert!(is_valid_service_name("_my-service._udp."));
        assert!(!is_valid_service_name("_ipp._tcp.local."));
        assert!(!is_valid_service_name("ipp._tcp."));
        assert!(!is_valid_service_name("_._tcp."));
        assert!(!is_valid_service_name("_this-is-much-too-long._tcp."));
        assert!(!is_valid_service_name("_a--b._tcp."));
        assert!(!is_valid_service_name("_123._tcp."));
    }

    #[test]
    fn test_label_validation() {
        assert!(is_valid_host_name("office"));
        assert!(!is_valid_host_name(""));
        assert!(!is_valid_host_name("office.local"));
        assert!(!is_valid_host_name(&"x".repeat(64)));

        assert!(is_valid_instance_name("Living Room"));
        assert!(!is_valid_instance_name("v1.2"));
        assert!(!is_valid_instance_name(""));

        assert!(is_valid_subtype_name("_color"));
        assert!(!is_valid_subtype_name("_a.b"));
        assert!(!is_valid_subtype_name("no-underscore"));
        assert!(!is_valid_subtype_name("_"));
    }

    #[test]
    fn test_host_name_change() {
        assert_eq!(host_name_change("foo"), "foo-2");
        assert_eq!(host_name_change("foo-2"), "foo-3");
        assert_eq!(host_name_change("my-host"), "my-host-2");
    }

    #[test]
    fn test_alt_host_name() {
        let alt = alt_host_name("office");
        assert!(alt.starts_with("office-"));
        assert_eq!(alt.len(), "office-".len() + 4);
        assert!(alt_host_name("OFFICE").ends_with(&alt["office".len()..]));
        assert!(is_valid_host_name(&alt_host_name(&"x".repeat(63))));
    }
}
