//! CNI result documents across protocol versions
//!
//! Results are held in one internal shape and converted from/to the wire form
//! of whichever version the runtime speaks. 0.1.0 and 0.2.0 use the legacy
//! `ip4`/`ip6` layout; 0.3.x and 0.4.0 tag each IP with its family; 1.0.0
//! drops the tag.

use super::error::CniError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::net::IpAddr;

/// Version the internal representation corresponds to
pub const CURRENT_VERSION: &str = "1.0.0";

/// Versions this plugin can read and produce, oldest first
pub const SUPPORTED_VERSIONS: &[&str] = &["0.1.0", "0.2.0", "0.3.0", "0.3.1", "0.4.0", "1.0.0"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WireFormat {
    Legacy,
    Tagged,
    Current,
}

fn wire_format(version: &str) -> Result<WireFormat, CniError> {
    match version {
        // An absent version means the oldest one
        "" | "0.1.0" | "0.2.0" => Ok(WireFormat::Legacy),
        "0.3.0" | "0.3.1" | "0.4.0" => Ok(WireFormat::Tagged),
        "1.0.0" => Ok(WireFormat::Current),
        other => Err(CniError::IncompatibleVersion(other.to_string())),
    }
}

/// Fail unless `version` is one this plugin speaks
pub fn check_version(version: &str) -> Result<(), CniError> {
    wire_format(version).map(|_| ())
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interface {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub mac: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtu: Option<u32>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sandbox: String,
}

/// One assigned address, `address` in CIDR notation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpConfig {
    pub interface: Option<usize>,
    pub address: String,
    pub gateway: Option<IpAddr>,
}

impl IpConfig {
    fn is_v4(&self) -> Result<bool, CniError> {
        cidr_is_v4(&self.address)
    }
}

fn cidr_is_v4(cidr: &str) -> Result<bool, CniError> {
    let (ip, prefix) = cidr
        .split_once('/')
        .ok_or_else(|| CniError::InvalidResult(format!("invalid CIDR address {:?}", cidr)))?;
    prefix
        .parse::<u8>()
        .map_err(|_| CniError::InvalidResult(format!("invalid prefix length in {:?}", cidr)))?;
    let ip: IpAddr = ip
        .parse()
        .map_err(|_| CniError::InvalidResult(format!("invalid IP address in {:?}", cidr)))?;
    Ok(ip.is_ipv4())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub dst: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gw: Option<IpAddr>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dns {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nameservers: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub domain: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub search: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

impl Dns {
    pub fn is_empty(&self) -> bool {
        self.nameservers.is_empty()
            && self.domain.is_empty()
            && self.search.is_empty()
            && self.options.is_empty()
    }
}

/// Version-independent CNI result
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CniResult {
    pub interfaces: Vec<Interface>,
    pub ips: Vec<IpConfig>,
    pub routes: Vec<Route>,
    pub dns: Dns,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyResult {
    #[serde(default)]
    cni_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ip4: Option<LegacyIpConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ip6: Option<LegacyIpConfig>,
    #[serde(default, skip_serializing_if = "Dns::is_empty")]
    dns: Dns,
}

#[derive(Serialize, Deserialize)]
struct LegacyIpConfig {
    ip: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    gateway: Option<IpAddr>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    routes: Vec<Route>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireResult {
    #[serde(default)]
    cni_version: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    interfaces: Vec<Interface>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    ips: Vec<WireIpConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    routes: Vec<Route>,
    #[serde(default, skip_serializing_if = "Dns::is_empty")]
    dns: Dns,
}

#[derive(Serialize, Deserialize)]
struct WireIpConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    interface: Option<usize>,
    address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    gateway: Option<IpAddr>,
}

fn decode<T: serde::de::DeserializeOwned>(value: Value) -> Result<T, CniError> {
    serde_json::from_value(value).map_err(|e| CniError::InvalidResult(e.to_string()))
}

fn encode<T: Serialize>(doc: &T) -> Result<Value, CniError> {
    serde_json::to_value(doc).map_err(|e| CniError::Internal(e.to_string()))
}

impl CniResult {
    /// Parse a result document written in `version`
    pub fn from_value(version: &str, value: Value) -> Result<Self, CniError> {
        match wire_format(version)? {
            WireFormat::Legacy => {
                let legacy: LegacyResult = decode(value)?;
                let mut result = CniResult {
                    dns: legacy.dns,
                    ..Default::default()
                };
                for ip in [legacy.ip4, legacy.ip6].into_iter().flatten() {
                    cidr_is_v4(&ip.ip)?;
                    result.ips.push(IpConfig {
                        interface: None,
                        address: ip.ip,
                        gateway: ip.gateway,
                    });
                    result.routes.extend(ip.routes);
                }
                Ok(result)
            }
            WireFormat::Tagged | WireFormat::Current => {
                let wire: WireResult = decode(value)?;
                let mut ips = Vec::with_capacity(wire.ips.len());
                for ip in wire.ips {
                    if let Some(idx) = ip.interface {
                        if idx >= wire.interfaces.len() {
                            return Err(CniError::InvalidResult(format!(
                                "IP {} refers to missing interface {}",
                                ip.address, idx
                            )));
                        }
                    }
                    cidr_is_v4(&ip.address)?;
                    ips.push(IpConfig {
                        interface: ip.interface,
                        address: ip.address,
                        gateway: ip.gateway,
                    });
                }
                Ok(CniResult {
                    interfaces: wire.interfaces,
                    ips,
                    routes: wire.routes,
                    dns: wire.dns,
                })
            }
        }
    }

    /// Render this result as a `version` document
    pub fn to_value(&self, version: &str) -> Result<Value, CniError> {
        let version = if version.is_empty() {
            SUPPORTED_VERSIONS[0]
        } else {
            version
        };
        match wire_format(version)? {
            WireFormat::Legacy => {
                let mut legacy = LegacyResult {
                    cni_version: version.to_string(),
                    ip4: None,
                    ip6: None,
                    dns: self.dns.clone(),
                };
                for ip in &self.ips {
                    let slot = if ip.is_v4()? {
                        &mut legacy.ip4
                    } else {
                        &mut legacy.ip6
                    };
                    // The legacy layout has room for one address per family
                    if slot.is_none() {
                        *slot = Some(LegacyIpConfig {
                            ip: ip.address.clone(),
                            gateway: ip.gateway,
                            routes: Vec::new(),
                        });
                    }
                }
                for route in &self.routes {
                    let slot = if cidr_is_v4(&route.dst)? {
                        &mut legacy.ip4
                    } else {
                        &mut legacy.ip6
                    };
                    if let Some(ip) = slot {
                        ip.routes.push(route.clone());
                    }
                }
                encode(&legacy)
            }
            format => {
                let mut ips = Vec::with_capacity(self.ips.len());
                for ip in &self.ips {
                    let family = if ip.is_v4()? { "4" } else { "6" };
                    ips.push(WireIpConfig {
                        version: (format == WireFormat::Tagged).then(|| family.to_string()),
                        interface: ip.interface,
                        address: ip.address.clone(),
                        gateway: ip.gateway,
                    });
                }
                encode(&WireResult {
                    cni_version: version.to_string(),
                    interfaces: self.interfaces.clone(),
                    ips,
                    routes: self.routes.clone(),
                    dns: self.dns.clone(),
                })
            }
        }
    }
}

/// Document printed for the VERSION command
pub fn version_info(cni_version: &str) -> Value {
    serde_json::json!({
        "cniVersion": cni_version,
        "supportedVersions": SUPPORTED_VERSIONS,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn calico_031() -> Value {
        json!({
            "cniVersion": "0.3.1",
            "interfaces": [
                {"name": "cali1234", "mac": "ee:ee:ee:ee:ee:ee"},
                {"name": "eth0", "sandbox": "/var/run/netns/cni-1234"}
            ],
            "ips": [
                {"version": "4", "interface": 1, "address": "10.244.1.7/32", "gateway": "169.254.1.1"},
                {"version": "6", "interface": 1, "address": "fd00:10:244::7/128"}
            ],
            "routes": [{"dst": "0.0.0.0/0"}, {"dst": "::/0", "gw": "fe80::1"}],
            "dns": {"nameservers": ["10.96.0.10"], "search": ["svc.cluster.local"]}
        })
    }

    #[test]
    fn test_prev_result_round_trip() {
        let doc = calico_031();
        let result = CniResult::from_value("0.3.1", doc.clone()).unwrap();
        assert_eq!(result.to_value("0.3.1").unwrap(), doc);

        let mut current = doc;
        current["cniVersion"] = json!("1.0.0");
        for ip in current["ips"].as_array_mut().unwrap() {
            ip.as_object_mut().unwrap().remove("version");
        }
        let result = CniResult::from_value("1.0.0", current.clone()).unwrap();
        assert_eq!(result.to_value("1.0.0").unwrap(), current);
    }

    #[test]
    fn test_version_tags_are_rederived() {
        let doc = json!({
            "cniVersion": "1.0.0",
            "ips": [{"address": "fd00::2/64"}, {"address": "10.0.0.2/24"}]
        });
        let result = CniResult::from_value("1.0.0", doc).unwrap();

        let out = result.to_value("0.4.0").unwrap();
        assert_eq!(out["ips"][0]["version"], "6");
        assert_eq!(out["ips"][1]["version"], "4");
    }

    #[test]
    fn test_legacy_conversion() {
        let result = CniResult::from_value("0.3.1", calico_031()).unwrap();
        let legacy = result.to_value("0.2.0").unwrap();

        assert_eq!(legacy["cniVersion"], "0.2.0");
        assert_eq!(legacy["ip4"]["ip"], "10.244.1.7/32");
        assert_eq!(legacy["ip4"]["gateway"], "169.254.1.1");
        assert_eq!(legacy["ip4"]["routes"][0]["dst"], "0.0.0.0/0");
        assert_eq!(legacy["ip6"]["routes"][0]["gw"], "fe80::1");
        assert!(legacy.get("interfaces").is_none());

        let back = CniResult::from_value("0.2.0", legacy).unwrap();
        assert_eq!(back.ips.len(), 2);
        assert_eq!(back.routes.len(), 2);
        assert!(back.ips.iter().all(|ip| ip.interface.is_none()));
    }

    #[test]
    fn test_empty_result() {
        let out = CniResult::default().to_value("0.3.1").unwrap();
        assert_eq!(out, json!({"cniVersion": "0.3.1"}));
    }

    #[test]
    fn test_unsupported_version() {
        let res = CniResult::default().to_value("0.5.0");
        assert!(matches!(res, Err(CniError::IncompatibleVersion(v)) if v == "0.5.0"));
    }

    #[test]
    fn test_invalid_interface_index() {
        let doc = json!({
            "cniVersion": "0.3.1",
            "ips": [{"version": "4", "interface": 3, "address": "10.0.0.2/24"}]
        });
        let res = CniResult::from_value("0.3.1", doc);
        assert!(matches!(res, Err(CniError::InvalidResult(_))));
    }

    #[test]
    fn test_version_info() {
        let info = version_info("0.4.0");
        assert_eq!(info["supportedVersions"].as_array().unwrap().len(), 6);
    }
}
