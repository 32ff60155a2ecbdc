use structopt::StructOpt;

use crate::BootstrapSalt;

fn parses(args: &[&str]) -> bool {
    let mut argv = vec!["bootstrap-salt"];
    argv.extend_from_slice(args);
    BootstrapSalt::from_iter_safe(argv).is_ok()
}

#[test]
fn rollout_interval_must_be_positive() {
    assert!(parses(&["highstate", "--timeout", "3600", "--interval", "5"]), "expected a positive interval to parse");
    assert!(!parses(&["highstate", "--timeout", "3600", "--interval", "0"]), "expected a zero interval to be rejected");
    assert!(!parses(&["wait-for-minions", "--interval", "0"]), "expected a zero wait interval to be rejected");
    assert!(!parses(&["cfn-create", "--template", "stack.json", "--interval", "0"]), "expected a zero stack interval to be rejected");
}

#[test]
fn rollout_fraction_is_validated() {
    assert!(parses(&["state", "nginx", "--fraction", "0.25"]), "expected a valid fraction to parse");
    assert!(!parses(&["state", "nginx", "--fraction", "1.5"]), "expected a fraction above one to be rejected");
}

#[test]
fn salt_update_parses_host_flags() {
    assert!(parses(&["salt-update", "-s", "highstate", "--ignore-errors"]), "expected a state run to parse");
    assert!(parses(&["salt-update", "--update-only"]), "expected an update only run to parse");
}
