//! Whole-tree configuration validation.
//!
//! Every rule fails with an error naming the offending field. Rules are
//! checked in section order; the first violation aborts startup.

use std::collections::BTreeSet;

use regex::Regex;

use crate::error::{Error, Result};
use crate::network::IpPrefix;
use crate::types::{ForwardingAlgorithm, ForwardingType};

use super::{
    AddPath, OpenrConfig, PolicyConfig, PrefixAllocationMode, SrNodeLabelType,
};

pub fn validate(conf: &OpenrConfig) -> Result<()> {
    if conf.node_name.is_empty() {
        return Err(Error::invalid_config("node_name", "must not be empty"));
    }
    if conf.prefix_forwarding_algorithm == ForwardingAlgorithm::Ksp2EdEcmp
        && conf.prefix_forwarding_type != ForwardingType::SrMpls
    {
        return Err(Error::invalid_config(
            "prefix_forwarding_algorithm",
            "KSP2_ED_ECMP requires SR_MPLS forwarding",
        ));
    }

    validate_areas(conf)?;
    validate_spark(conf)?;
    validate_kvstore(conf)?;
    validate_link_monitor(conf)?;
    validate_decision(conf)?;
    validate_monitor(conf)?;
    validate_prefix_allocation(conf)?;
    validate_bgp(conf)?;
    validate_segment_routing(conf)?;
    validate_watchdog(conf)?;
    validate_vip(conf)?;
    validate_fib(conf)?;
    validate_static_routes(conf)?;
    Ok(())
}

fn check_regexes(list: &[String], field: String) -> Result<()> {
    for s in list {
        Regex::new(s).map_err(|e| Error::invalid_config(field.clone(), format!("bad regex {:?}: {}", s, e)))?;
    }
    Ok(())
}

fn validate_areas(conf: &OpenrConfig) -> Result<()> {
    let mut seen = BTreeSet::new();
    for area in &conf.areas {
        if !seen.insert(area.area_id.clone()) {
            return Err(Error::DuplicateKey(format!("areas[{}]", area.area_id)));
        }
        let field = |name: &str| format!("areas[{}].{}", area.area_id, name);

        check_regexes(&area.include_interface_regexes, field("include_interface_regexes"))?;
        check_regexes(&area.exclude_interface_regexes, field("exclude_interface_regexes"))?;
        check_regexes(
            &area.redistribute_interface_regexes,
            field("redistribute_interface_regexes"),
        )?;
        check_regexes(&area.neighbor_regexes, field("neighbor_regexes"))?;

        // An area with nothing to match on only makes sense as a
        // domain-wide scope.
        if area.include_interface_regexes.is_empty()
            && area.neighbor_regexes.is_empty()
            && conf.domain.is_empty()
        {
            return Err(Error::invalid_config(
                "domain",
                format!(
                    "area {} has no interface or neighbor regexes and no domain is set",
                    area.area_id
                ),
            ));
        }

        if let Some(policy) = &area.import_policy_name {
            if !policy_defined(conf.area_policies.as_ref(), policy) {
                return Err(Error::invalid_config(
                    field("import_policy_name"),
                    format!("policy {:?} is not defined in area_policies", policy),
                ));
            }
        }

        if let Some(node_label) = &area.sr_node_label {
            match node_label.label_type {
                SrNodeLabelType::Auto => {
                    let range = node_label.node_segment_label_range.ok_or_else(|| {
                        Error::invalid_config(
                            field("sr_node_label.node_segment_label_range"),
                            "required for AUTO node segment labels",
                        )
                    })?;
                    if range.is_empty() {
                        return Err(Error::out_of_range(
                            field("sr_node_label.node_segment_label_range"),
                            format!(
                                "start_label {} must be <= end_label {}",
                                range.start_label, range.end_label
                            ),
                        ));
                    }
                }
                SrNodeLabelType::Static => {
                    let label = node_label.static_label.ok_or_else(|| {
                        Error::invalid_config(
                            field("sr_node_label.static_label"),
                            "required for STATIC node segment labels",
                        )
                    })?;
                    if let Some(range) = node_label.node_segment_label_range {
                        if !range.contains(label) {
                            return Err(Error::out_of_range(
                                field("sr_node_label.static_label"),
                                format!("label {} outside configured range", label),
                            ));
                        }
                    }
                }
            }
        }
    }
    Ok(())
}

fn validate_spark(conf: &OpenrConfig) -> Result<()> {
    let spark = &conf.spark_config;

    if spark.neighbor_discovery_port <= 0 || spark.neighbor_discovery_port > 65535 {
        return Err(Error::out_of_range(
            "spark_config.neighbor_discovery_port",
            "must be in 1..=65535",
        ));
    }
    for (value, name) in [
        (spark.hello_time_s, "spark_config.hello_time_s"),
        (spark.fastinit_hello_time_ms, "spark_config.fastinit_hello_time_ms"),
        (spark.fastinit_window_s, "spark_config.fastinit_window_s"),
        (spark.keepalive_time_s, "spark_config.keepalive_time_s"),
        (spark.hold_time_s, "spark_config.hold_time_s"),
        (spark.graceful_restart_time_s, "spark_config.graceful_restart_time_s"),
    ] {
        if value <= 0 {
            return Err(Error::out_of_range(name, "must be positive"));
        }
    }
    if spark.fastinit_hello_time_ms > spark.hello_time_s * 1000 {
        return Err(Error::invalid_config(
            "spark_config.fastinit_hello_time_ms, spark_config.hello_time_s",
            format!(
                "fast-init hello interval {} ms exceeds hello interval {} s",
                spark.fastinit_hello_time_ms, spark.hello_time_s
            ),
        ));
    }
    if spark.keepalive_time_s > spark.hold_time_s {
        return Err(Error::invalid_config(
            "spark_config.keepalive_time_s, spark_config.hold_time_s",
            format!(
                "keepalive {} s exceeds hold {} s",
                spark.keepalive_time_s, spark.hold_time_s
            ),
        ));
    }
    if spark.graceful_restart_time_s < 3 * spark.keepalive_time_s {
        return Err(Error::invalid_config(
            "spark_config.graceful_restart_time_s",
            format!(
                "must be at least 3x keepalive_time_s ({} s)",
                3 * spark.keepalive_time_s
            ),
        ));
    }

    let sd = &spark.step_detector_conf;
    for (value, name) in [
        (sd.fast_window_size, "spark_config.step_detector_conf.fast_window_size"),
        (sd.slow_window_size, "spark_config.step_detector_conf.slow_window_size"),
        (sd.lower_threshold, "spark_config.step_detector_conf.lower_threshold"),
        (sd.upper_threshold, "spark_config.step_detector_conf.upper_threshold"),
    ] {
        if value <= 0 {
            return Err(Error::invalid_config(name, "must be positive"));
        }
    }
    if sd.fast_window_size > sd.slow_window_size {
        return Err(Error::invalid_config(
            "spark_config.step_detector_conf.fast_window_size",
            "must not exceed slow_window_size",
        ));
    }
    if sd.lower_threshold > sd.upper_threshold {
        return Err(Error::invalid_config(
            "spark_config.step_detector_conf.lower_threshold",
            "must not exceed upper_threshold",
        ));
    }
    Ok(())
}

fn validate_kvstore(conf: &OpenrConfig) -> Result<()> {
    let kv = &conf.kvstore_config;
    if kv.key_ttl_ms <= 0 {
        return Err(Error::out_of_range("kvstore_config.key_ttl_ms", "must be positive"));
    }
    if kv.sync_port < 0 || kv.sync_port > 65535 {
        return Err(Error::out_of_range(
            "kvstore_config.sync_port",
            "must be in 0..=65535",
        ));
    }
    if let Some(rate) = &kv.flood_rate {
        if rate.flood_msg_per_sec <= 0 {
            return Err(Error::out_of_range(
                "kvstore_config.flood_rate.flood_msg_per_sec",
                "must be positive",
            ));
        }
        if rate.flood_msg_burst_size <= 0 {
            return Err(Error::out_of_range(
                "kvstore_config.flood_rate.flood_msg_burst_size",
                "must be positive",
            ));
        }
    }
    if kv.key_flap_initial_backoff_ms < 0 || kv.key_flap_max_backoff_ms < 0 {
        return Err(Error::out_of_range(
            "kvstore_config.key_flap_initial_backoff_ms",
            "backoffs must be non-negative",
        ));
    }
    if kv.key_flap_initial_backoff_ms > kv.key_flap_max_backoff_ms {
        return Err(Error::out_of_range(
            "kvstore_config.key_flap_initial_backoff_ms",
            "must not exceed key_flap_max_backoff_ms",
        ));
    }
    Ok(())
}

fn validate_link_monitor(conf: &OpenrConfig) -> Result<()> {
    let lm = &conf.link_monitor_config;
    if lm.linkflap_initial_backoff_ms < 0 {
        return Err(Error::out_of_range(
            "link_monitor_config.linkflap_initial_backoff_ms",
            "must be non-negative",
        ));
    }
    if lm.linkflap_max_backoff_ms < 0 {
        return Err(Error::out_of_range(
            "link_monitor_config.linkflap_max_backoff_ms",
            "must be non-negative",
        ));
    }
    if lm.linkflap_initial_backoff_ms > lm.linkflap_max_backoff_ms {
        return Err(Error::out_of_range(
            "link_monitor_config.linkflap_initial_backoff_ms",
            format!(
                "initial backoff {} ms exceeds max backoff {} ms",
                lm.linkflap_initial_backoff_ms, lm.linkflap_max_backoff_ms
            ),
        ));
    }
    check_regexes(
        &lm.include_interface_regexes,
        "link_monitor_config.include_interface_regexes".to_string(),
    )?;
    check_regexes(
        &lm.exclude_interface_regexes,
        "link_monitor_config.exclude_interface_regexes".to_string(),
    )?;
    check_regexes(
        &lm.redistribute_interface_regexes,
        "link_monitor_config.redistribute_interface_regexes".to_string(),
    )?;
    Ok(())
}

fn validate_decision(conf: &OpenrConfig) -> Result<()> {
    let d = &conf.decision_config;
    if d.debounce_min_ms <= 0 || d.debounce_max_ms <= 0 {
        return Err(Error::out_of_range(
            "decision_config.debounce_min_ms",
            "debounce windows must be positive",
        ));
    }
    if d.debounce_min_ms > d.debounce_max_ms {
        return Err(Error::invalid_config(
            "decision_config.debounce_min_ms",
            "must not exceed debounce_max_ms",
        ));
    }
    Ok(())
}

fn validate_monitor(conf: &OpenrConfig) -> Result<()> {
    if conf.monitor_config.max_event_log < 0 {
        return Err(Error::out_of_range(
            "monitor_config.max_event_log",
            "must be non-negative",
        ));
    }
    Ok(())
}

fn validate_prefix_allocation(conf: &OpenrConfig) -> Result<()> {
    if !conf.enable_prefix_allocation {
        return Ok(());
    }
    let pa = conf.prefix_allocation_config.as_ref().ok_or_else(|| {
        Error::invalid_config(
            "prefix_allocation_config",
            "required when enable_prefix_allocation is set",
        )
    })?;

    match pa.prefix_allocation_mode {
        PrefixAllocationMode::DynamicRootNode => {
            let seed = pa.seed_prefix.as_deref().ok_or_else(|| {
                Error::invalid_config(
                    "prefix_allocation_config.seed_prefix",
                    "required for DYNAMIC_ROOT_NODE",
                )
            })?;
            let alloc_len = pa.allocate_prefix_len.ok_or_else(|| {
                Error::invalid_config(
                    "prefix_allocation_config.allocate_prefix_len",
                    "required for DYNAMIC_ROOT_NODE",
                )
            })?;
            let seed: IpPrefix = seed.parse()?;
            if alloc_len <= seed.prefix_len() {
                return Err(Error::out_of_range(
                    "prefix_allocation_config.allocate_prefix_len",
                    format!(
                        "must exceed seed prefix length {}",
                        seed.prefix_len()
                    ),
                ));
            }
            if seed.is_v4() && !conf.enable_v4 {
                return Err(Error::invalid_config(
                    "prefix_allocation_config.seed_prefix",
                    "v4 seed prefix requires enable_v4",
                ));
            }
        }
        PrefixAllocationMode::DynamicLeafNode | PrefixAllocationMode::Static => {
            if pa.seed_prefix.is_some() || pa.allocate_prefix_len.is_some() {
                return Err(Error::invalid_config(
                    "prefix_allocation_config.seed_prefix",
                    "only valid for DYNAMIC_ROOT_NODE",
                ));
            }
            if pa.prefix_allocation_mode == PrefixAllocationMode::Static {
                if let Some(p) = &pa.static_prefix {
                    let _: IpPrefix = p.parse()?;
                }
            }
        }
    }
    Ok(())
}

fn bgp_add_path_enabled(conf: &OpenrConfig) -> bool {
    conf.bgp_config
        .as_ref()
        .map(|bgp| {
            bgp.peers
                .iter()
                .any(|p| matches!(p.add_path, Some(AddPath::Receive | AddPath::Send | AddPath::Both)))
        })
        .unwrap_or(false)
}

fn validate_bgp(conf: &OpenrConfig) -> Result<()> {
    if conf.enable_bgp_peering && conf.bgp_config.is_none() {
        return Err(Error::invalid_config(
            "bgp_config",
            "required when enable_bgp_peering is set",
        ));
    }
    if conf.bgp_translation_config.is_some() && conf.bgp_config.is_none() {
        return Err(Error::invalid_config(
            "bgp_config",
            "bgp_translation_config is set without bgp_config",
        ));
    }
    if let Some(tr) = &conf.bgp_translation_config {
        if tr.disable_legacy_translation && !(tr.enable_bgp_to_openr && tr.enable_openr_to_bgp) {
            return Err(Error::invalid_config(
                "bgp_translation_config.disable_legacy_translation",
                "requires both enable_bgp_to_openr and enable_openr_to_bgp",
            ));
        }
    }
    if bgp_add_path_enabled(conf) && !conf.enable_segment_routing {
        return Err(Error::invalid_config(
            "enable_segment_routing",
            "required when a BGP peer enables add_path",
        ));
    }
    Ok(())
}

fn validate_segment_routing(conf: &OpenrConfig) -> Result<()> {
    let Some(sr) = &conf.segment_routing_config else {
        return Ok(());
    };
    if let Some(adj) = &sr.sr_adj_label {
        if let Some(range) = adj.adj_label_range {
            if range.is_empty() {
                return Err(Error::out_of_range(
                    "segment_routing_config.sr_adj_label.adj_label_range",
                    "start_label must be <= end_label",
                ));
            }
        }
    }
    let Some(policies) = &sr.sr_policies else {
        return Ok(());
    };
    if policies.is_empty() {
        return Ok(());
    }
    if !conf.enable_segment_routing {
        return Err(Error::invalid_config(
            "segment_routing_config.sr_policies",
            "requires enable_segment_routing",
        ));
    }
    if !bgp_add_path_enabled(conf) {
        return Err(Error::invalid_config(
            "segment_routing_config.sr_policies",
            "requires a BGP peer with add_path enabled",
        ));
    }
    let area_ids: BTreeSet<&str> = conf.areas.iter().map(|a| a.area_id.as_str()).collect();
    for policy in policies {
        if policy.rules.area_path_computation_rules.is_empty() {
            return Err(Error::invalid_config(
                format!("segment_routing_config.sr_policies[{}].rules", policy.name),
                "at least one area path computation rule is required",
            ));
        }
        for area in policy.rules.area_path_computation_rules.keys() {
            if !area_ids.contains(area.as_str()) {
                return Err(Error::invalid_config(
                    format!("segment_routing_config.sr_policies[{}].rules", policy.name),
                    format!("references undefined area {:?}", area),
                ));
            }
        }
        for criteria in &policy.matcher.criterias {
            if let Some(stack) = &criteria.area_stack {
                if !policy_defined(conf.area_policies.as_ref(), stack) {
                    return Err(Error::invalid_config(
                        format!("segment_routing_config.sr_policies[{}].matcher", policy.name),
                        format!("area_stack filter {:?} is not defined", stack),
                    ));
                }
            }
        }
    }
    Ok(())
}

fn validate_watchdog(conf: &OpenrConfig) -> Result<()> {
    if conf.enable_watchdog {
        let wd = conf.watchdog_config.as_ref().ok_or_else(|| {
            Error::invalid_config("watchdog_config", "required when enable_watchdog is set")
        })?;
        for (value, name) in [
            (wd.interval_s, "watchdog_config.interval_s"),
            (wd.thread_timeout_s, "watchdog_config.thread_timeout_s"),
            (wd.max_memory_mb, "watchdog_config.max_memory_mb"),
        ] {
            if value <= 0 {
                return Err(Error::out_of_range(name, "must be positive"));
            }
        }
    }
    Ok(())
}

fn validate_vip(conf: &OpenrConfig) -> Result<()> {
    if !conf.enable_vip_service {
        return Ok(());
    }
    let vip = conf.vip_service_config.as_ref().ok_or_else(|| {
        Error::invalid_config(
            "vip_service_config",
            "required when enable_vip_service is set",
        )
    })?;
    if let Some(policy) = &vip.ingress_policy {
        if !policy_defined(conf.area_policies.as_ref(), policy) {
            return Err(Error::invalid_config(
                "vip_service_config.ingress_policy",
                format!("policy {:?} is not defined in area_policies", policy),
            ));
        }
    }
    Ok(())
}

fn validate_fib(conf: &OpenrConfig) -> Result<()> {
    if conf.route_delete_delay_ms < 0 {
        return Err(Error::invalid_config(
            "route_delete_delay_ms",
            "must be non-negative",
        ));
    }
    Ok(())
}

fn validate_static_routes(conf: &OpenrConfig) -> Result<()> {
    for (i, route) in conf.static_routes.iter().enumerate() {
        let _: IpPrefix = route
            .prefix
            .parse()
            .map_err(|_| Error::InvalidAddressFormat(format!("static_routes[{}].prefix: {}", i, route.prefix)))?;
        route.nexthop.parse::<std::net::IpAddr>().map_err(|_| {
            Error::InvalidAddressFormat(format!("static_routes[{}].nexthop: {}", i, route.nexthop))
        })?;
    }
    for p in &conf.originated_prefixes {
        let _: IpPrefix = p.parse()?;
    }
    Ok(())
}

fn policy_defined(policies: Option<&PolicyConfig>, name: &str) -> bool {
    policies
        .and_then(|p| p.filters.as_ref())
        .and_then(|f| f.route_propagation_policy.as_ref())
        .map(|f| f.objects.contains_key(name))
        .unwrap_or(false)
}
