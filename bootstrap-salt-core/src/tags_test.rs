use std::net::IpAddr;

use anyhow::Result;

use crate::models::{Filters, Instance, StackId};
use crate::tags::{TagKey, Tags};

#[test]
fn tag_keys_round_trip_through_raw_strings() {
    for raw in ["SaltMaster", "SaltMasterPrvIP", "aws:cloudformation:stack-id", "aws:cloudformation:stack-name", "Name", "Env"] {
        let key = TagKey::from(raw);
        assert_eq!(key.as_str(), raw, "expected key {:?} to keep its raw form", key);
    }
    assert_eq!(TagKey::from("Env"), TagKey::Other("Env".into()));
    assert_eq!(TagKey::from("SaltMaster".to_string()), TagKey::SaltMaster);
}

#[test]
fn master_tags_mark_instance_as_master() -> Result<()> {
    let ip: IpAddr = "10.0.0.1".parse()?;
    let tags = Tags::master(ip);
    assert!(tags.is_master(), "expected master tags to mark a master");
    assert_eq!(tags.get(&TagKey::SaltMaster), Some("True"));
    assert_eq!(tags.configured_master(), Some(ip));
    Ok(())
}

#[test]
fn malformed_master_ip_is_treated_as_unconfigured() {
    let tags: Tags = vec![("SaltMasterPrvIP", "not-an-ip")].into_iter().collect();
    assert_eq!(tags.configured_master(), None);
    assert!(!tags.is_master());
}

#[test]
fn instance_convergence_checks_current_master_only() -> Result<()> {
    let current: IpAddr = "10.0.0.1".parse()?;
    let stale: IpAddr = "10.0.0.2".parse()?;
    let instance = Instance {
        id: "i-1".into(),
        public_ip: None,
        private_ip: Some("10.0.0.9".parse()?),
        tags: Tags::minion_of(stale),
    };
    assert!(!instance.is_configured_against(current), "a minion of a stale master must not count as configured");
    assert!(instance.is_configured_against(stale));
    assert_eq!(instance.ssh_address(), instance.private_ip, "expected ssh to fall back to the private ip");
    Ok(())
}

#[test]
fn member_filters_do_not_mutate_the_given_filters() {
    let stack = StackId::new("arn:aws:cloudformation:eu-west-1:123/stack-name/uuid");
    let mut defaults = Filters::new();
    defaults.insert("instance-state-name".into(), "running".into());

    let merged = stack.member_filters(&defaults);

    assert_eq!(defaults.len(), 1, "the caller's filters must be left untouched");
    assert_eq!(merged.get("tag:aws:cloudformation:stack-id").map(String::as_str), Some(stack.as_str()));
    assert_eq!(merged.get("instance-state-name").map(String::as_str), Some("running"));
}

#[test]
fn tags_serialize_as_a_flat_map() -> Result<()> {
    let tags: Tags = vec![("SaltMaster", "True"), ("Env", "dev")].into_iter().collect();
    let json = serde_json::to_value(&tags)?;
    assert_eq!(json, serde_json::json!({"SaltMaster": "True", "Env": "dev"}));
    let parsed: Tags = serde_json::from_value(json)?;
    assert_eq!(parsed, tags);
    Ok(())
}
