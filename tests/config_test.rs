//! Configuration loading and rejection, driven through real files.

use open_r::config::Config;
use open_r::error::Error;

fn write_config(json: &str) -> tempfile::NamedTempFile {
    use std::io::Write;
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(json.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

#[test]
fn test_valid_config_from_file() {
    let file = write_config(
        r#"{
            "node_name": "node-1",
            "domain": "test-domain",
            "areas": [
                {
                    "area_id": "spine",
                    "include_interface_regexes": ["fboss.*"],
                    "neighbor_regexes": ["rsw.*"]
                }
            ],
            "enable_v4": true
        }"#,
    );
    let config = Config::from_file(file.path()).unwrap();
    assert_eq!(config.node_name(), "node-1");
    assert_eq!(config.domain(), "test-domain");
    assert!(config.is_v4_enabled());
    assert_eq!(config.areas().len(), 1);
    assert!(config.areas().contains_key("spine"));
}

#[test]
fn test_missing_file_rejected() {
    assert!(Config::from_file("/no/such/config.json").is_err());
}

#[test]
fn test_malformed_json_rejected() {
    let file = write_config(r#"{"node_name": "n1", "areas": "this should be a list"}"#);
    let err = Config::from_file(file.path()).unwrap_err();
    assert!(matches!(err, Error::InvalidConfiguration { .. }));
}

#[test]
fn test_unknown_option_rejected() {
    let file = write_config(r#"{"node_name": "n1", "domain": "d", "no_such_option": 1}"#);
    let err = Config::from_file(file.path()).unwrap_err();
    assert!(err.to_string().contains("no_such_option"));
}

/// S6: fast-init hello slower than the hello interval is rejected at
/// startup, naming both offending fields.
#[test]
fn test_s6_fastinit_exceeding_hello_rejected() {
    let file = write_config(
        r#"{
            "node_name": "node-1",
            "domain": "test-domain",
            "spark_config": {
                "fastinit_hello_time_ms": 10000,
                "hello_time_s": 2
            }
        }"#,
    );
    let err = Config::from_file(file.path()).unwrap_err();
    let msg = err.to_string();
    assert!(msg.contains("invalid configuration"), "got: {}", msg);
    assert!(msg.contains("fastinit_hello_time_ms"), "got: {}", msg);
    assert!(msg.contains("hello_time_s"), "got: {}", msg);
}

#[test]
fn test_out_of_range_port_rejected() {
    let file = write_config(
        r#"{
            "node_name": "node-1",
            "domain": "test-domain",
            "spark_config": {"neighbor_discovery_port": 65536}
        }"#,
    );
    let err = Config::from_file(file.path()).unwrap_err();
    assert!(matches!(err, Error::OutOfRange { .. }));
    assert!(err.to_string().contains("neighbor_discovery_port"));
}

#[test]
fn test_duplicate_area_rejected() {
    let file = write_config(
        r#"{
            "node_name": "node-1",
            "domain": "test-domain",
            "areas": [
                {"area_id": "a", "include_interface_regexes": ["x.*"]},
                {"area_id": "a", "include_interface_regexes": ["y.*"]}
            ]
        }"#,
    );
    let err = Config::from_file(file.path()).unwrap_err();
    assert!(matches!(err, Error::DuplicateKey(_)));
}

#[test]
fn test_bad_seed_prefix_is_address_format_error() {
    let file = write_config(
        r#"{
            "node_name": "node-1",
            "domain": "test-domain",
            "enable_prefix_allocation": true,
            "prefix_allocation_config": {
                "prefix_allocation_mode": "DynamicRootNode",
                "seed_prefix": "fc00:cafe:babe:/64",
                "allocate_prefix_len": 128
            }
        }"#,
    );
    let err = Config::from_file(file.path()).unwrap_err();
    assert!(matches!(err, Error::InvalidAddressFormat(_)));
}

#[test]
fn test_watchdog_requires_config_block() {
    let file = write_config(
        r#"{
            "node_name": "node-1",
            "domain": "test-domain",
            "enable_watchdog": true
        }"#,
    );
    let err = Config::from_file(file.path()).unwrap_err();
    assert!(err.to_string().contains("watchdog_config"));
}

#[test]
fn test_derived_eor_default() {
    let file = write_config(
        r#"{
            "node_name": "node-1",
            "domain": "test-domain",
            "spark_config": {"keepalive_time_s": 2, "hold_time_s": 10, "graceful_restart_time_s": 30}
        }"#,
    );
    let config = Config::from_file(file.path()).unwrap();
    assert_eq!(config.eor_time(), std::time::Duration::from_secs(6));
}
