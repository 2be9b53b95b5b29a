//! Node configuration: declarative JSON tree, total validation, typed views.
//!
//! The raw tree (`OpenrConfig`) is deserialized with unknown fields
//! rejected, validated as a whole, then frozen behind `Config`. The daemon
//! never sees a half-valid configuration: any rule violation aborts startup
//! naming the offending field. Reconfiguration means restart.

mod validation;

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::network::IpPrefix;
use crate::types::{AreaId, ForwardingAlgorithm, ForwardingType, Label};

/// Area id used when no areas are configured and the node falls back to
/// domain-wide flooding.
pub const DEFAULT_AREA_ID: &str = "0";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OpenrConfig {
    #[serde(default)]
    pub node_name: String,
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub areas: Vec<AreaConfig>,
    #[serde(default)]
    pub enable_v4: bool,
    #[serde(default)]
    pub enable_segment_routing: bool,
    #[serde(default)]
    pub enable_bgp_peering: bool,
    #[serde(default)]
    pub enable_prefix_allocation: bool,
    #[serde(default)]
    pub enable_watchdog: bool,
    #[serde(default)]
    pub enable_vip_service: bool,
    #[serde(default)]
    pub enable_flood_optimization: bool,
    #[serde(default = "default_true")]
    pub enable_graceful_restart: bool,
    #[serde(default)]
    pub prefix_forwarding_type: ForwardingType,
    #[serde(default)]
    pub prefix_forwarding_algorithm: ForwardingAlgorithm,
    #[serde(default)]
    pub prefix_allocation_config: Option<PrefixAllocationConfig>,
    #[serde(default)]
    pub spark_config: SparkConfig,
    #[serde(default)]
    pub kvstore_config: KvStoreConfig,
    #[serde(default)]
    pub link_monitor_config: LinkMonitorConfig,
    #[serde(default)]
    pub decision_config: DecisionConfig,
    #[serde(default)]
    pub monitor_config: MonitorConfig,
    #[serde(default)]
    pub watchdog_config: Option<WatchdogConfig>,
    #[serde(default)]
    pub vip_service_config: Option<VipServiceConfig>,
    #[serde(default)]
    pub bgp_config: Option<BgpConfig>,
    #[serde(default)]
    pub bgp_translation_config: Option<BgpTranslationConfig>,
    #[serde(default)]
    pub segment_routing_config: Option<SegmentRoutingConfig>,
    #[serde(default)]
    pub area_policies: Option<PolicyConfig>,
    #[serde(default)]
    pub static_routes: Vec<StaticRouteConfig>,
    #[serde(default)]
    pub originated_prefixes: Vec<String>,
    #[serde(default = "default_route_delete_delay_ms")]
    pub route_delete_delay_ms: i64,
    #[serde(default)]
    pub eor_time_s: Option<i64>,
    #[serde(default)]
    pub shared_key: Option<String>,
    #[serde(default = "default_persistent_store_path")]
    pub persistent_store_path: String,
}

impl Default for OpenrConfig {
    /// The defaults are exactly the serde field defaults; an empty
    /// document deserializes to the same tree.
    fn default() -> Self {
        serde_json::from_str("{}").expect("empty config must deserialize")
    }
}

fn default_true() -> bool {
    true
}

fn default_route_delete_delay_ms() -> i64 {
    1000
}

fn default_persistent_store_path() -> String {
    "/var/lib/open-r/state.json".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AreaConfig {
    pub area_id: String,
    #[serde(default)]
    pub include_interface_regexes: Vec<String>,
    #[serde(default)]
    pub exclude_interface_regexes: Vec<String>,
    #[serde(default)]
    pub redistribute_interface_regexes: Vec<String>,
    #[serde(default)]
    pub neighbor_regexes: Vec<String>,
    #[serde(default)]
    pub import_policy_name: Option<String>,
    #[serde(default)]
    pub sr_node_label: Option<SegmentRoutingNodeLabel>,
    #[serde(default)]
    pub sr_adj_label: Option<SegmentRoutingAdjLabel>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PrefixAllocationMode {
    Static,
    DynamicLeafNode,
    DynamicRootNode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PrefixAllocationConfig {
    pub prefix_allocation_mode: PrefixAllocationMode,
    #[serde(default)]
    pub seed_prefix: Option<String>,
    #[serde(default)]
    pub allocate_prefix_len: Option<u8>,
    #[serde(default)]
    pub static_prefix: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SparkConfig {
    #[serde(default = "default_neighbor_discovery_port")]
    pub neighbor_discovery_port: i64,
    #[serde(default = "default_hello_time_s")]
    pub hello_time_s: i64,
    #[serde(default = "default_fastinit_hello_time_ms")]
    pub fastinit_hello_time_ms: i64,
    #[serde(default = "default_fastinit_window_s")]
    pub fastinit_window_s: i64,
    #[serde(default = "default_keepalive_time_s")]
    pub keepalive_time_s: i64,
    #[serde(default = "default_hold_time_s")]
    pub hold_time_s: i64,
    #[serde(default = "default_graceful_restart_time_s")]
    pub graceful_restart_time_s: i64,
    #[serde(default)]
    pub step_detector_conf: StepDetectorConfig,
}

fn default_neighbor_discovery_port() -> i64 {
    6666
}
fn default_hello_time_s() -> i64 {
    20
}
fn default_fastinit_hello_time_ms() -> i64 {
    500
}
fn default_fastinit_window_s() -> i64 {
    10
}
fn default_keepalive_time_s() -> i64 {
    2
}
fn default_hold_time_s() -> i64 {
    10
}
fn default_graceful_restart_time_s() -> i64 {
    30
}

impl Default for SparkConfig {
    fn default() -> Self {
        SparkConfig {
            neighbor_discovery_port: default_neighbor_discovery_port(),
            hello_time_s: default_hello_time_s(),
            fastinit_hello_time_ms: default_fastinit_hello_time_ms(),
            fastinit_window_s: default_fastinit_window_s(),
            keepalive_time_s: default_keepalive_time_s(),
            hold_time_s: default_hold_time_s(),
            graceful_restart_time_s: default_graceful_restart_time_s(),
            step_detector_conf: StepDetectorConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StepDetectorConfig {
    #[serde(default = "default_fast_window_size")]
    pub fast_window_size: i64,
    #[serde(default = "default_slow_window_size")]
    pub slow_window_size: i64,
    #[serde(default = "default_lower_threshold")]
    pub lower_threshold: i64,
    #[serde(default = "default_upper_threshold")]
    pub upper_threshold: i64,
}

fn default_fast_window_size() -> i64 {
    10
}
fn default_slow_window_size() -> i64 {
    60
}
fn default_lower_threshold() -> i64 {
    2
}
fn default_upper_threshold() -> i64 {
    5
}

impl Default for StepDetectorConfig {
    fn default() -> Self {
        StepDetectorConfig {
            fast_window_size: default_fast_window_size(),
            slow_window_size: default_slow_window_size(),
            lower_threshold: default_lower_threshold(),
            upper_threshold: default_upper_threshold(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KvStoreConfig {
    #[serde(default = "default_key_ttl_ms")]
    pub key_ttl_ms: i64,
    /// TCP port for peer sync sessions; 0 binds an ephemeral port.
    #[serde(default)]
    pub sync_port: i64,
    #[serde(default)]
    pub flood_rate: Option<KvStoreFloodRate>,
    #[serde(default = "default_key_flap_initial_backoff_ms")]
    pub key_flap_initial_backoff_ms: i64,
    #[serde(default = "default_key_flap_max_backoff_ms")]
    pub key_flap_max_backoff_ms: i64,
}

fn default_key_ttl_ms() -> i64 {
    300_000
}
fn default_key_flap_initial_backoff_ms() -> i64 {
    1000
}
fn default_key_flap_max_backoff_ms() -> i64 {
    60_000
}

impl Default for KvStoreConfig {
    fn default() -> Self {
        KvStoreConfig {
            key_ttl_ms: default_key_ttl_ms(),
            sync_port: 0,
            flood_rate: None,
            key_flap_initial_backoff_ms: default_key_flap_initial_backoff_ms(),
            key_flap_max_backoff_ms: default_key_flap_max_backoff_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KvStoreFloodRate {
    pub flood_msg_per_sec: i64,
    pub flood_msg_burst_size: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LinkMonitorConfig {
    #[serde(default = "default_linkflap_initial_backoff_ms")]
    pub linkflap_initial_backoff_ms: i64,
    #[serde(default = "default_linkflap_max_backoff_ms")]
    pub linkflap_max_backoff_ms: i64,
    #[serde(default)]
    pub include_interface_regexes: Vec<String>,
    #[serde(default)]
    pub exclude_interface_regexes: Vec<String>,
    #[serde(default)]
    pub redistribute_interface_regexes: Vec<String>,
    #[serde(default = "default_true")]
    pub enable_rtt_metric: bool,
    #[serde(default = "default_link_metric")]
    pub default_link_metric: u32,
}

fn default_linkflap_initial_backoff_ms() -> i64 {
    1000
}
fn default_linkflap_max_backoff_ms() -> i64 {
    60_000
}
fn default_link_metric() -> u32 {
    1
}

impl Default for LinkMonitorConfig {
    fn default() -> Self {
        LinkMonitorConfig {
            linkflap_initial_backoff_ms: default_linkflap_initial_backoff_ms(),
            linkflap_max_backoff_ms: default_linkflap_max_backoff_ms(),
            include_interface_regexes: Vec::new(),
            exclude_interface_regexes: Vec::new(),
            redistribute_interface_regexes: Vec::new(),
            enable_rtt_metric: true,
            default_link_metric: default_link_metric(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DecisionConfig {
    #[serde(default = "default_debounce_min_ms")]
    pub debounce_min_ms: i64,
    #[serde(default = "default_debounce_max_ms")]
    pub debounce_max_ms: i64,
}

fn default_debounce_min_ms() -> i64 {
    10
}
fn default_debounce_max_ms() -> i64 {
    250
}

impl Default for DecisionConfig {
    fn default() -> Self {
        DecisionConfig {
            debounce_min_ms: default_debounce_min_ms(),
            debounce_max_ms: default_debounce_max_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MonitorConfig {
    #[serde(default = "default_max_event_log")]
    pub max_event_log: i64,
}

fn default_max_event_log() -> i64 {
    100
}

impl Default for MonitorConfig {
    fn default() -> Self {
        MonitorConfig {
            max_event_log: default_max_event_log(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WatchdogConfig {
    #[serde(default = "default_watchdog_interval_s")]
    pub interval_s: i64,
    #[serde(default = "default_thread_timeout_s")]
    pub thread_timeout_s: i64,
    #[serde(default = "default_max_memory_mb")]
    pub max_memory_mb: i64,
}

fn default_watchdog_interval_s() -> i64 {
    20
}
fn default_thread_timeout_s() -> i64 {
    300
}
fn default_max_memory_mb() -> i64 {
    800
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        WatchdogConfig {
            interval_s: default_watchdog_interval_s(),
            thread_timeout_s: default_thread_timeout_s(),
            max_memory_mb: default_max_memory_mb(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VipServiceConfig {
    #[serde(default)]
    pub ingress_policy: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BgpConfig {
    #[serde(default)]
    pub router_id: Option<String>,
    #[serde(default)]
    pub peers: Vec<BgpPeer>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BgpPeer {
    pub peer_addr: String,
    #[serde(default)]
    pub add_path: Option<AddPath>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AddPath {
    Receive,
    Send,
    Both,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BgpTranslationConfig {
    #[serde(default)]
    pub enable_bgp_to_openr: bool,
    #[serde(default)]
    pub enable_openr_to_bgp: bool,
    #[serde(default)]
    pub disable_legacy_translation: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelRange {
    pub start_label: Label,
    pub end_label: Label,
}

impl LabelRange {
    pub fn len(&self) -> u64 {
        (self.end_label as u64).saturating_sub(self.start_label as u64) + 1
    }

    pub fn is_empty(&self) -> bool {
        self.end_label < self.start_label
    }

    pub fn contains(&self, label: Label) -> bool {
        label >= self.start_label && label <= self.end_label
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SrNodeLabelType {
    Auto,
    Static,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SegmentRoutingNodeLabel {
    pub label_type: SrNodeLabelType,
    #[serde(default)]
    pub node_segment_label_range: Option<LabelRange>,
    #[serde(default)]
    pub static_label: Option<Label>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SrAdjLabelType {
    AutoIfindex,
    Static,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SegmentRoutingAdjLabel {
    pub label_type: SrAdjLabelType,
    #[serde(default)]
    pub adj_label_range: Option<LabelRange>,
    #[serde(default)]
    pub static_label: Option<Label>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SegmentRoutingConfig {
    #[serde(default)]
    pub sr_adj_label: Option<SegmentRoutingAdjLabel>,
    #[serde(default)]
    pub prepend_label_ranges: Option<MplsLabelRanges>,
    #[serde(default)]
    pub sr_policies: Option<Vec<SrPolicy>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MplsLabelRanges {
    pub v4: LabelRange,
    pub v6: LabelRange,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SrPolicy {
    pub name: String,
    #[serde(default)]
    pub matcher: SrPolicyMatcher,
    #[serde(default)]
    pub rules: RouteComputationRules,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SrPolicyMatcher {
    #[serde(default)]
    pub criterias: Vec<FilterCriteria>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FilterCriteria {
    #[serde(default)]
    pub bgp_community_filters: Vec<String>,
    #[serde(default)]
    pub openr_tag_filters: Vec<String>,
    #[serde(default)]
    pub area_stack: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouteComputationRules {
    #[serde(default)]
    pub area_path_computation_rules: BTreeMap<String, AreaPathComputationRules>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AreaPathComputationRules {
    #[serde(default)]
    pub forwarding_algorithm: Option<ForwardingAlgorithm>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyConfig {
    #[serde(default)]
    pub filters: Option<PolicyFilters>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyFilters {
    #[serde(default)]
    pub route_propagation_policy: Option<Filters>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Filters {
    #[serde(default)]
    pub objects: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StaticRouteConfig {
    pub prefix: String,
    pub nexthop: String,
    pub iface: String,
    #[serde(default = "default_link_metric")]
    pub metric: u32,
}

/// Per-area view with compiled matchers.
#[derive(Debug)]
pub struct AreaConfiguration {
    pub area_id: AreaId,
    include_interface_regexes: Vec<Regex>,
    exclude_interface_regexes: Vec<Regex>,
    redistribute_interface_regexes: Vec<Regex>,
    neighbor_regexes: Vec<Regex>,
    pub sr_node_label: Option<SegmentRoutingNodeLabel>,
    pub sr_adj_label: Option<SegmentRoutingAdjLabel>,
}

fn any_match(regexes: &[Regex], name: &str) -> bool {
    regexes.iter().any(|r| r.is_match(name))
}

impl AreaConfiguration {
    /// Does this area run neighbor discovery on the interface?
    pub fn should_discover_on_iface(&self, iface: &str) -> bool {
        if iface.is_empty() {
            return false;
        }
        any_match(&self.include_interface_regexes, iface)
            && !any_match(&self.exclude_interface_regexes, iface)
    }

    /// Would this area accept the node as a neighbor?
    pub fn should_peer_with_neighbor(&self, node: &str) -> bool {
        if node.is_empty() {
            return false;
        }
        any_match(&self.neighbor_regexes, node)
    }

    /// Should the interface's own addresses be redistributed?
    pub fn should_redistribute_iface(&self, iface: &str) -> bool {
        if iface.is_empty() {
            return false;
        }
        any_match(&self.redistribute_interface_regexes, iface)
    }
}

/// Validated, immutable configuration handed to every component.
#[derive(Debug)]
pub struct Config {
    raw: OpenrConfig,
    areas: BTreeMap<AreaId, AreaConfiguration>,
    domain_token: u64,
}

impl Config {
    /// Load and validate a configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Config> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let raw: OpenrConfig = serde_json::from_str(&text)
            .map_err(|e| Error::invalid_config("<config file>", e.to_string()))?;
        Config::new(raw)
    }

    /// Validate an in-memory tree. Derived defaults are materialized here.
    pub fn new(mut raw: OpenrConfig) -> Result<Config> {
        // areas falling back to the link-monitor matchers + domain scope
        if raw.areas.is_empty() {
            if raw.domain.is_empty() && raw.link_monitor_config.include_interface_regexes.is_empty()
            {
                return Err(Error::invalid_config(
                    "domain",
                    "no areas configured and no domain to scope the default area",
                ));
            }
            let include = if raw.link_monitor_config.include_interface_regexes.is_empty() {
                vec![".*".to_string()]
            } else {
                raw.link_monitor_config.include_interface_regexes.clone()
            };
            raw.areas.push(AreaConfig {
                area_id: DEFAULT_AREA_ID.to_string(),
                include_interface_regexes: include,
                exclude_interface_regexes: raw.link_monitor_config.exclude_interface_regexes.clone(),
                redistribute_interface_regexes: raw
                    .link_monitor_config
                    .redistribute_interface_regexes
                    .clone(),
                neighbor_regexes: vec![".*".to_string()],
                import_policy_name: None,
                sr_node_label: None,
                sr_adj_label: None,
            });
        }
        if raw.eor_time_s.is_none() {
            raw.eor_time_s = Some(3 * raw.spark_config.keepalive_time_s);
        }

        validation::validate(&raw)?;

        let mut areas = BTreeMap::new();
        for area in &raw.areas {
            areas.insert(area.area_id.clone(), compile_area(area)?);
        }
        let domain_token = raw
            .shared_key
            .as_deref()
            .map(hash_shared_key)
            .unwrap_or(0);

        Ok(Config {
            raw,
            areas,
            domain_token,
        })
    }

    pub fn node_name(&self) -> &str {
        &self.raw.node_name
    }

    pub fn domain(&self) -> &str {
        &self.raw.domain
    }

    pub fn areas(&self) -> &BTreeMap<AreaId, AreaConfiguration> {
        &self.areas
    }

    pub fn is_v4_enabled(&self) -> bool {
        self.raw.enable_v4
    }

    pub fn is_segment_routing_enabled(&self) -> bool {
        self.raw.enable_segment_routing
    }

    pub fn is_bgp_peering_enabled(&self) -> bool {
        self.raw.enable_bgp_peering
    }

    pub fn is_prefix_allocation_enabled(&self) -> bool {
        self.raw.enable_prefix_allocation
    }

    pub fn is_watchdog_enabled(&self) -> bool {
        self.raw.enable_watchdog
    }

    pub fn is_vip_service_enabled(&self) -> bool {
        self.raw.enable_vip_service
    }

    pub fn is_graceful_restart_enabled(&self) -> bool {
        self.raw.enable_graceful_restart
    }

    pub fn prefix_forwarding_type(&self) -> ForwardingType {
        self.raw.prefix_forwarding_type
    }

    pub fn prefix_forwarding_algorithm(&self) -> ForwardingAlgorithm {
        self.raw.prefix_forwarding_algorithm
    }

    pub fn spark(&self) -> &SparkConfig {
        &self.raw.spark_config
    }

    pub fn kvstore(&self) -> &KvStoreConfig {
        &self.raw.kvstore_config
    }

    pub fn link_monitor(&self) -> &LinkMonitorConfig {
        &self.raw.link_monitor_config
    }

    pub fn decision(&self) -> &DecisionConfig {
        &self.raw.decision_config
    }

    pub fn watchdog(&self) -> Option<&WatchdogConfig> {
        self.raw.watchdog_config.as_ref()
    }

    pub fn prefix_allocation(&self) -> Option<&PrefixAllocationConfig> {
        self.raw.prefix_allocation_config.as_ref()
    }

    pub fn static_routes(&self) -> &[StaticRouteConfig] {
        &self.raw.static_routes
    }

    pub fn originated_prefixes(&self) -> Result<Vec<IpPrefix>> {
        self.raw
            .originated_prefixes
            .iter()
            .map(|s| s.parse::<IpPrefix>())
            .collect()
    }

    pub fn key_ttl(&self) -> Duration {
        Duration::from_millis(self.raw.kvstore_config.key_ttl_ms as u64)
    }

    pub fn route_delete_delay(&self) -> Duration {
        Duration::from_millis(self.raw.route_delete_delay_ms as u64)
    }

    pub fn eor_time(&self) -> Duration {
        Duration::from_secs(self.raw.eor_time_s.unwrap_or(0) as u64)
    }

    /// Shared-key framing token carried on every wire frame.
    pub fn domain_token(&self) -> u64 {
        self.domain_token
    }

    pub fn persistent_store_path(&self) -> &str {
        &self.raw.persistent_store_path
    }

    /// Node segment label for an area: static value, or a deterministic
    /// pick from the configured range keyed on the node name.
    pub fn node_segment_label(&self, area: &str) -> Label {
        let Some(area_conf) = self.areas.get(area) else {
            return 0;
        };
        let Some(node_label) = &area_conf.sr_node_label else {
            return 0;
        };
        match node_label.label_type {
            SrNodeLabelType::Static => node_label.static_label.unwrap_or(0),
            SrNodeLabelType::Auto => {
                let range = match node_label.node_segment_label_range {
                    Some(r) => r,
                    None => return 0,
                };
                let h = stable_hash(self.raw.node_name.as_bytes());
                range.start_label + (h % range.len()) as Label
            }
        }
    }

    pub fn raw(&self) -> &OpenrConfig {
        &self.raw
    }
}

fn compile_area(area: &AreaConfig) -> Result<AreaConfiguration> {
    let compile = |list: &[String], field: &str| -> Result<Vec<Regex>> {
        list.iter()
            .map(|s| {
                Regex::new(s).map_err(|e| {
                    Error::invalid_config(
                        format!("areas[{}].{}", area.area_id, field),
                        format!("bad regex {:?}: {}", s, e),
                    )
                })
            })
            .collect()
    };
    Ok(AreaConfiguration {
        area_id: area.area_id.clone(),
        include_interface_regexes: compile(
            &area.include_interface_regexes,
            "include_interface_regexes",
        )?,
        exclude_interface_regexes: compile(
            &area.exclude_interface_regexes,
            "exclude_interface_regexes",
        )?,
        redistribute_interface_regexes: compile(
            &area.redistribute_interface_regexes,
            "redistribute_interface_regexes",
        )?,
        neighbor_regexes: compile(&area.neighbor_regexes, "neighbor_regexes")?,
        sr_node_label: area.sr_node_label.clone(),
        sr_adj_label: area.sr_adj_label.clone(),
    })
}

fn hash_shared_key(key: &str) -> u64 {
    stable_hash(key.as_bytes())
}

/// Deterministic 64-bit digest, stable across nodes and builds.
pub(crate) fn stable_hash(bytes: &[u8]) -> u64 {
    let digest = Sha256::digest(bytes);
    let mut out = [0u8; 8];
    out.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(out)
}

/// Config builders shared by unit and integration tests.
pub mod testing {
    use super::*;

    /// Minimal valid configuration used across tests.
    pub fn basic_config(node_name: &str) -> OpenrConfig {
        OpenrConfig {
            node_name: node_name.to_string(),
            domain: "test-domain".to_string(),
            ..Default::default()
        }
    }

    pub fn area_config(area_id: &str) -> AreaConfig {
        AreaConfig {
            area_id: area_id.to_string(),
            include_interface_regexes: vec!["fboss.*".to_string()],
            neighbor_regexes: vec!["rsw.*".to_string()],
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_area_configuration_matchers() {
        let area = AreaConfig {
            area_id: "myArea".to_string(),
            include_interface_regexes: vec!["iface.*".to_string()],
            exclude_interface_regexes: vec![".*400.*".to_string(), ".*450.*".to_string()],
            redistribute_interface_regexes: vec!["loopback1".to_string()],
            neighbor_regexes: vec!["fsw.*".to_string()],
            ..Default::default()
        };

        let mut raw = testing::basic_config("node-1");
        raw.areas = vec![area];
        let cfg = Config::new(raw).unwrap();

        let conf = cfg.areas().get("myArea").unwrap();
        assert!(conf.should_peer_with_neighbor("fsw001"));
        assert!(!conf.should_peer_with_neighbor("rsw001"));
        assert!(!conf.should_peer_with_neighbor(""));

        assert!(conf.should_discover_on_iface("iface20"));
        assert!(!conf.should_discover_on_iface("iface400"));
        assert!(!conf.should_discover_on_iface("iface450"));
        assert!(!conf.should_discover_on_iface("loopback1"));
        assert!(!conf.should_discover_on_iface(""));

        assert!(conf.should_redistribute_iface("loopback1"));
        assert!(!conf.should_redistribute_iface("loopback10"));
        assert!(!conf.should_redistribute_iface(""));
    }

    #[test]
    fn test_empty_areas_fall_back_to_link_monitor_matchers() {
        let mut raw = testing::basic_config("node-1");
        raw.link_monitor_config.include_interface_regexes = vec!["fboss.*".to_string()];
        raw.link_monitor_config.exclude_interface_regexes = vec!["eth.*".to_string()];
        raw.link_monitor_config.redistribute_interface_regexes = vec!["lo".to_string()];
        let cfg = Config::new(raw).unwrap();

        let area = cfg.areas().get(DEFAULT_AREA_ID).unwrap();
        assert!(area.should_discover_on_iface("fboss10"));
        assert!(!area.should_discover_on_iface("eth0"));
        assert!(area.should_redistribute_iface("lo"));
        assert!(!area.should_redistribute_iface("eth0"));
    }

    #[test]
    fn test_eor_time_derived_from_keepalive() {
        let mut raw = testing::basic_config("node-1");
        raw.spark_config.keepalive_time_s = 2;
        let cfg = Config::new(raw).unwrap();
        assert_eq!(cfg.eor_time(), Duration::from_secs(6));

        let mut raw = testing::basic_config("node-1");
        raw.spark_config.keepalive_time_s = 2;
        raw.eor_time_s = Some(2);
        let cfg = Config::new(raw).unwrap();
        assert_eq!(cfg.eor_time(), Duration::from_secs(2));
    }

    #[test]
    fn test_node_segment_label_static_and_auto() {
        let mut raw = testing::basic_config("node-1");
        let mut area = testing::area_config("a1");
        area.sr_node_label = Some(SegmentRoutingNodeLabel {
            label_type: SrNodeLabelType::Static,
            node_segment_label_range: None,
            static_label: Some(4242),
        });
        raw.areas = vec![area];
        let cfg = Config::new(raw).unwrap();
        assert_eq!(cfg.node_segment_label("a1"), 4242);

        let mut raw = testing::basic_config("node-1");
        let mut area = testing::area_config("a1");
        area.sr_node_label = Some(SegmentRoutingNodeLabel {
            label_type: SrNodeLabelType::Auto,
            node_segment_label_range: Some(LabelRange {
                start_label: 101,
                end_label: 200,
            }),
            static_label: None,
        });
        raw.areas = vec![area];
        let cfg = Config::new(raw).unwrap();
        let label = cfg.node_segment_label("a1");
        assert!((101..=200).contains(&label));
        // deterministic for the same node name
        assert_eq!(label, {
            let mut raw = testing::basic_config("node-1");
            let mut area = testing::area_config("a1");
            area.sr_node_label = Some(SegmentRoutingNodeLabel {
                label_type: SrNodeLabelType::Auto,
                node_segment_label_range: Some(LabelRange {
                    start_label: 101,
                    end_label: 200,
                }),
                static_label: None,
            });
            raw.areas = vec![area];
            Config::new(raw).unwrap().node_segment_label("a1")
        });
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let json = r#"{"node_name": "n1", "domain": "d", "no_such_option": true}"#;
        let parsed: std::result::Result<OpenrConfig, _> = serde_json::from_str(json);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_domain_token_differs_by_key() {
        let mut raw = testing::basic_config("node-1");
        raw.shared_key = Some("alpha".to_string());
        let a = Config::new(raw).unwrap().domain_token();

        let mut raw = testing::basic_config("node-1");
        raw.shared_key = Some("beta".to_string());
        let b = Config::new(raw).unwrap().domain_token();

        assert_ne!(a, b);
        let mut raw = testing::basic_config("node-1");
        raw.shared_key = None;
        assert_eq!(Config::new(raw).unwrap().domain_token(), 0);
    }
}
