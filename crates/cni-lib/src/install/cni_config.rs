//! CNI network configuration files
//!
//! Selection of the runtime's default network, rendering of this plugin's
//! configuration stanza, and merging it into (or removing it from) an
//! existing plugin list.

use super::config::{CNI_CONFIG_MODE, PLUGIN_TYPE, STANDALONE_CONF_NAME};
use super::{InstallError, InstallerConfig};
use crate::fs::{atomic_write, exists, remove_if_exists};
use crate::watch::{wait_for_change_or_cancel, watch};
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// File extensions the container runtime loads network configuration from
const CNI_CONFIG_EXTENSIONS: &[&str] = &["conf", "conflist", "json"];

const DEFAULT_NETWORK_CONFIG_TEMPLATE: &str = r#"{
  "cniVersion": "0.3.1",
  "name": "msm-cni",
  "type": "msm-cni",
  "logLevel": "__LOG_LEVEL__",
  "kubernetes": {
    "kubeConfig": "__KUBECONFIG_FILEPATH__",
    "nodeName": "__KUBERNETES_NODE_NAME__",
    "cniBinDir": "/opt/cni/bin",
    "excludeNamespaces": ["kube-system"]
  }
}"#;

/// Parsed CNI config document
pub type CniConfigMap = Map<String, Value>;

/// Read a CNI config file as a JSON object
pub fn read_cni_config_map(path: &Path) -> Result<CniConfigMap, InstallError> {
    let raw = fs::read(path).map_err(|e| InstallError::io(path, e))?;
    serde_json::from_slice(&raw).map_err(|source| InstallError::Json {
        path: path.to_path_buf(),
        source,
    })
}

/// Serialize a CNI config document, pretty-printed with a trailing newline
pub fn marshal_cni_config(map: &CniConfigMap) -> Result<Vec<u8>, InstallError> {
    let mut out = serde_json::to_vec_pretty(map).map_err(|source| InstallError::Json {
        path: PathBuf::new(),
        source,
    })?;
    out.push(b'\n');
    Ok(out)
}

fn plugin_type(plugin: &Value) -> Option<&str> {
    plugin.get("type").and_then(Value::as_str)
}

/// The `plugins` list of a chained config
pub fn plugins<'a>(map: &'a CniConfigMap, path: &Path) -> Result<&'a Vec<Value>, InstallError> {
    map.get("plugins")
        .and_then(Value::as_array)
        .ok_or_else(|| InstallError::InvalidCniConfig {
            path: path.to_path_buf(),
            reason: "error reading plugin list from CNI config".to_string(),
        })
}

/// Number of entries in the plugin list whose type is this plugin's
pub fn count_plugin_entries(map: &CniConfigMap, path: &Path) -> Result<usize, InstallError> {
    let mut count = 0;
    for plugin in plugins(map, path)? {
        if !plugin.is_object() {
            return Err(InstallError::InvalidCniConfig {
                path: path.to_path_buf(),
                reason: "error reading plugin from CNI config plugin list".to_string(),
            });
        }
        if plugin_type(plugin) == Some(PLUGIN_TYPE) {
            count += 1;
        }
    }
    Ok(count)
}

fn has_cni_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| CNI_CONFIG_EXTENSIONS.contains(&e))
        .unwrap_or(false)
}

fn loads_as_network(path: &Path) -> Result<(), String> {
    let raw = fs::read(path).map_err(|e| e.to_string())?;
    let map: CniConfigMap = serde_json::from_slice(&raw).map_err(|e| e.to_string())?;

    if path.extension().and_then(|e| e.to_str()) == Some("conflist") {
        match map.get("plugins").and_then(Value::as_array) {
            Some(list) if !list.is_empty() => Ok(()),
            _ => Err("CNI config list has no plugins".to_string()),
        }
    } else {
        match map.get("type").and_then(Value::as_str) {
            Some(t) if !t.is_empty() => Ok(()),
            _ => Err("CNI config has no type".to_string()),
        }
    }
}

/// Name of the file the container runtime would pick as its default network
///
/// Candidate files are sorted lexicographically and the first one that loads
/// wins; files that fail to load are skipped.
pub fn get_default_cni_network(dir: &Path) -> Result<String, InstallError> {
    let entries = fs::read_dir(dir).map_err(|e| InstallError::io(dir, e))?;

    let mut candidates = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| InstallError::io(dir, e))?;
        let path = entry.path();
        let is_file = entry.file_type().map(|t| !t.is_dir()).unwrap_or(false);
        if is_file && has_cni_extension(&path) {
            candidates.push(path);
        }
    }
    candidates.sort();

    for path in candidates {
        match loads_as_network(&path) {
            Ok(()) => {
                if let Some(name) = path.file_name() {
                    return Ok(name.to_string_lossy().into_owned());
                }
            }
            Err(reason) => {
                warn!(path = %path.display(), reason = %reason, "Skipping unloadable CNI config file");
            }
        }
    }

    Err(InstallError::NoNetworks(dir.to_path_buf()))
}

/// Render this plugin's network config from the configured template
pub fn render_network_config(cfg: &InstallerConfig) -> Result<CniConfigMap, InstallError> {
    let template = if let Some(file) = &cfg.cni_network_config_file {
        fs::read_to_string(file).map_err(|e| InstallError::io(file, e))?
    } else if !cfg.cni_network_config.is_empty() {
        cfg.cni_network_config.clone()
    } else {
        DEFAULT_NETWORK_CONFIG_TEMPLATE.to_string()
    };

    let rendered = template
        .replace("__LOG_LEVEL__", &cfg.log_level)
        .replace(
            "__KUBECONFIG_FILEPATH__",
            &cfg.host_kubeconfig_path().to_string_lossy(),
        )
        .replace("__KUBERNETES_NODE_NAME__", &cfg.k8s_node_name)
        .replace("__KUBERNETES_SERVICE_HOST__", &cfg.k8s_service_host)
        .replace("__KUBERNETES_SERVICE_PORT__", &cfg.k8s_service_port);

    match serde_json::from_str::<Value>(&rendered) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(InstallError::Template(
            "CNI network config is not a JSON object".to_string(),
        )),
        Err(e) => Err(InstallError::Template(format!(
            "CNI network config is not valid JSON: {}",
            e
        ))),
    }
}

/// Insert the plugin stanza into an existing network configuration
///
/// A single-plugin document is first wrapped into a plugin list. Any previous
/// entries of this plugin are dropped so the list ends with exactly one.
pub fn insert_cni_config(
    mut stanza: CniConfigMap,
    existing: CniConfigMap,
    path: &Path,
) -> Result<CniConfigMap, InstallError> {
    let mut list = if existing.contains_key("plugins") {
        existing
    } else {
        let mut plugin = existing;
        let mut list = Map::new();
        if let Some(version) = plugin.remove("cniVersion") {
            list.insert("cniVersion".to_string(), version);
        }
        if let Some(name) = plugin.remove("name") {
            list.insert("name".to_string(), name);
        }
        list.insert(
            "plugins".to_string(),
            Value::Array(vec![Value::Object(plugin)]),
        );
        list
    };

    stanza.remove("cniVersion");

    let plugins = list
        .get_mut("plugins")
        .and_then(Value::as_array_mut)
        .ok_or_else(|| InstallError::InvalidCniConfig {
            path: path.to_path_buf(),
            reason: "error reading plugin list from CNI config".to_string(),
        })?;
    plugins.retain(|p| plugin_type(p) != Some(PLUGIN_TYPE));
    plugins.push(Value::Object(stanza));

    Ok(list)
}

/// Remove this plugin's entries from a plugin list
pub fn remove_cni_config(mut list: CniConfigMap, path: &Path) -> Result<CniConfigMap, InstallError> {
    // Validates every entry before touching the list
    count_plugin_entries(&list, path)?;

    if let Some(plugins) = list.get_mut("plugins").and_then(Value::as_array_mut) {
        plugins.retain(|p| plugin_type(p) != Some(PLUGIN_TYPE));
    }
    Ok(list)
}

/// Decide which file the plugin config goes into
///
/// Chained installs without an explicit name follow the runtime's default
/// network, waiting on the directory until one exists.
async fn cni_config_filepath(
    cfg: &InstallerConfig,
    cancel: &CancellationToken,
) -> Result<PathBuf, InstallError> {
    let dir = &cfg.mounted_cni_net_dir;

    if !cfg.chained_cni_plugin {
        let name = cfg
            .cni_conf_name
            .clone()
            .unwrap_or_else(|| STANDALONE_CONF_NAME.to_string());
        return Ok(dir.join(name));
    }

    let (_watcher, mut events) = watch(dir)?;

    let filename = match &cfg.cni_conf_name {
        Some(name) => name.clone(),
        None => loop {
            match get_default_cni_network(dir) {
                Ok(name) => break name,
                Err(e) => {
                    info!(dir = %dir.display(), reason = %e, "Waiting for a default CNI network");
                    wait_for_change_or_cancel(&mut events, cancel).await?;
                }
            }
        },
    };

    let mut path = dir.join(&filename);
    while !exists(&path) {
        let as_string = path.to_string_lossy().into_owned();
        if as_string.ends_with(".conf") && exists(Path::new(&format!("{}list", as_string))) {
            path = PathBuf::from(format!("{}list", as_string));
            break;
        }
        if let Some(stripped) = as_string.strip_suffix("list") {
            if as_string.ends_with(".conflist") && exists(Path::new(stripped)) {
                path = PathBuf::from(stripped);
                break;
            }
        }

        info!(path = %path.display(), "Waiting for CNI config file to appear");
        wait_for_change_or_cancel(&mut events, cancel).await?;
    }

    Ok(path)
}

/// Write (standalone) or merge (chained) the plugin config; returns its path
pub async fn create_cni_config_file(
    cfg: &InstallerConfig,
    cancel: &CancellationToken,
) -> Result<PathBuf, InstallError> {
    let stanza = render_network_config(cfg)?;
    let mut path = cni_config_filepath(cfg, cancel).await?;

    if !cfg.chained_cni_plugin {
        atomic_write(&path, &marshal_cni_config(&stanza)?, CNI_CONFIG_MODE)?;
        info!(path = %path.display(), "Created standalone CNI config");
        return Ok(path);
    }

    let existing = read_cni_config_map(&path)?;
    let merged = insert_cni_config(stanza, existing, &path)?;

    let mut replaced = None;
    if path.extension().and_then(|e| e.to_str()) == Some("conf") {
        replaced = Some(path.clone());
        path.set_extension("conflist");
    }

    atomic_write(&path, &marshal_cni_config(&merged)?, CNI_CONFIG_MODE)?;
    if let Some(old) = replaced {
        remove_if_exists(&old)?;
        info!(old = %old.display(), new = %path.display(), "Converted CNI config to a plugin list");
    }
    info!(path = %path.display(), "Inserted msm-cni into CNI config plugin list");

    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn write_json(dir: &Path, name: &str, value: Value) {
        fs::write(dir.join(name), serde_json::to_vec(&value).unwrap()).unwrap();
    }

    fn calico_list() -> Value {
        json!({
            "cniVersion": "0.3.1",
            "name": "k8s-pod-network",
            "plugins": [
                {"type": "calico", "ipam": {"type": "calico-ipam"}},
                {"type": "portmap", "capabilities": {"portMappings": true}}
            ]
        })
    }

    fn chained_config(dir: &TempDir) -> InstallerConfig {
        InstallerConfig {
            mounted_cni_net_dir: dir.path().to_path_buf(),
            k8s_node_name: "node-a".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_default_network_is_lexicographically_first_valid() {
        let dir = TempDir::new().unwrap();
        write_json(dir.path(), "20-flannel.conflist", calico_list());
        write_json(dir.path(), "10-calico.conflist", calico_list());
        fs::write(dir.path().join("05-broken.conf"), b"not json").unwrap();
        write_json(dir.path(), "07-empty.conflist", json!({"plugins": []}));
        fs::write(dir.path().join("01-readme.txt"), b"ignored").unwrap();

        assert_eq!(
            get_default_cni_network(dir.path()).unwrap(),
            "10-calico.conflist"
        );
    }

    #[test]
    fn test_default_network_none_found() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("ZZZ-msm-cni-kubeconfig"), b"apiVersion: v1").unwrap();

        let res = get_default_cni_network(dir.path());
        assert!(matches!(res, Err(InstallError::NoNetworks(_))));
    }

    #[test]
    fn test_render_default_template() {
        let dir = TempDir::new().unwrap();
        let cfg = chained_config(&dir);

        let stanza = render_network_config(&cfg).unwrap();

        assert_eq!(stanza["type"], "msm-cni");
        assert_eq!(stanza["logLevel"], "warn");
        assert_eq!(
            stanza["kubernetes"]["kubeConfig"],
            "/etc/cni/net.d/ZZZ-msm-cni-kubeconfig"
        );
        assert_eq!(stanza["kubernetes"]["nodeName"], "node-a");
    }

    #[test]
    fn test_render_rejects_non_object_template() {
        let dir = TempDir::new().unwrap();
        let mut cfg = chained_config(&dir);
        cfg.cni_network_config = "[1, 2]".to_string();

        let res = render_network_config(&cfg);
        assert!(matches!(res, Err(InstallError::Template(_))));
    }

    #[test]
    fn test_insert_into_plugin_list_replaces_stale_entry() {
        let mut existing = calico_list();
        existing["plugins"]
            .as_array_mut()
            .unwrap()
            .push(json!({"type": "msm-cni", "logLevel": "debug"}));
        let existing = existing.as_object().unwrap().clone();
        let stanza = json!({"cniVersion": "0.3.1", "type": "msm-cni", "logLevel": "warn"})
            .as_object()
            .unwrap()
            .clone();

        let merged = insert_cni_config(stanza, existing, Path::new("x")).unwrap();

        assert_eq!(count_plugin_entries(&merged, Path::new("x")).unwrap(), 1);
        let list = merged["plugins"].as_array().unwrap();
        assert_eq!(list.len(), 3);
        assert_eq!(list[2]["logLevel"], "warn");
        assert!(list[2].get("cniVersion").is_none());
    }

    #[test]
    fn test_insert_wraps_single_plugin_conf() {
        let existing = json!({
            "cniVersion": "0.3.1",
            "name": "bridge-net",
            "type": "bridge",
            "bridge": "cni0"
        })
        .as_object()
        .unwrap()
        .clone();
        let stanza = json!({"type": "msm-cni"}).as_object().unwrap().clone();

        let merged = insert_cni_config(stanza, existing, Path::new("x")).unwrap();

        assert_eq!(merged["cniVersion"], "0.3.1");
        assert_eq!(merged["name"], "bridge-net");
        let list = merged["plugins"].as_array().unwrap();
        assert_eq!(list[0]["type"], "bridge");
        assert!(list[0].get("name").is_none());
        assert_eq!(list[1]["type"], "msm-cni");
    }

    #[test]
    fn test_remove_cni_config() {
        let mut doc = calico_list();
        doc["plugins"]
            .as_array_mut()
            .unwrap()
            .push(json!({"type": "msm-cni"}));
        let list = remove_cni_config(doc.as_object().unwrap().clone(), Path::new("x")).unwrap();

        assert_eq!(count_plugin_entries(&list, Path::new("x")).unwrap(), 0);
        assert_eq!(list["plugins"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_remove_cni_config_without_plugin_list() {
        let doc = json!({"type": "bridge"}).as_object().unwrap().clone();
        let res = remove_cni_config(doc, Path::new("x"));
        assert!(matches!(res, Err(InstallError::InvalidCniConfig { .. })));
    }

    #[tokio::test]
    async fn test_create_chained_config_file() {
        let dir = TempDir::new().unwrap();
        write_json(dir.path(), "10-calico.conflist", calico_list());
        let cfg = chained_config(&dir);

        let path = create_cni_config_file(&cfg, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(path, dir.path().join("10-calico.conflist"));
        let map = read_cni_config_map(&path).unwrap();
        assert_eq!(count_plugin_entries(&map, &path).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_create_chained_converts_conf_to_conflist() {
        let dir = TempDir::new().unwrap();
        write_json(
            dir.path(),
            "10-bridge.conf",
            json!({"cniVersion": "0.3.1", "name": "br", "type": "bridge"}),
        );
        let cfg = chained_config(&dir);

        let path = create_cni_config_file(&cfg, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(path, dir.path().join("10-bridge.conflist"));
        assert!(!dir.path().join("10-bridge.conf").exists());
        assert_eq!(get_default_cni_network(dir.path()).unwrap(), "10-bridge.conflist");
    }

    #[tokio::test]
    async fn test_create_standalone_config_file() {
        let dir = TempDir::new().unwrap();
        let mut cfg = chained_config(&dir);
        cfg.chained_cni_plugin = false;

        let path = create_cni_config_file(&cfg, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(path, dir.path().join(STANDALONE_CONF_NAME));
        let map = read_cni_config_map(&path).unwrap();
        assert_eq!(map["type"], "msm-cni");
    }

    #[tokio::test]
    async fn test_chained_waits_for_default_network_until_cancelled() {
        let dir = TempDir::new().unwrap();
        let cfg = chained_config(&dir);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let res = create_cni_config_file(&cfg, &cancel).await;
        assert!(res.as_ref().is_err_and(InstallError::is_cancelled));
    }

    #[tokio::test]
    async fn test_chained_picks_up_network_written_later() {
        let dir = TempDir::new().unwrap();
        let cfg = chained_config(&dir);
        let path = dir.path().to_path_buf();

        let writer = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            write_json(&path, "10-calico.conflist", calico_list());
        });

        let written = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            create_cni_config_file(&cfg, &CancellationToken::new()),
        )
        .await
        .expect("timed out waiting for default network")
        .unwrap();
        writer.await.unwrap();

        assert_eq!(written, dir.path().join("10-calico.conflist"));
    }
}
