//! End-to-end pipeline behaviour over the in-memory fakes.

use std::io::Write;

use conductor_core::fakes::FakeFleet;
use conductor_core::{ConductorError, HostOutput, TransportFailure};

#[tokio::test]
async fn test_deploy_packages_delivers_and_deploys() {
    let fleet = FakeFleet::new(&["n1", "n2"]);

    let results = fleet
        .deployer
        .deploy_for(&["all".to_string()])
        .await
        .unwrap();
    assert_eq!(results.len(), 2);
    assert!(results.values().all(HostOutput::is_success));

    let calls = fleet.platform("plat").recorded_calls();
    assert_eq!(
        calls.iter().filter(|c| c.as_str() == "package").count(),
        1,
        "each impacted platform is packaged exactly once"
    );
    assert!(calls.contains(&"deliver:n1".to_string()));
    assert!(calls.contains(&"deliver:n2".to_string()));
    assert!(calls.contains(&"deploy_actions:n1:false".to_string()));
    assert!(calls.contains(&"deploy_actions:n2:false".to_string()));

    // One transport call for the deployment, one for the log upload.
    let recorded = fleet.transport.recorded_calls();
    assert_eq!(recorded.len(), 2);

    let deploy_call = &recorded[0];
    assert!(!deploy_call.options.concurrent);
    assert!(deploy_call.options.log_to_stdout);
    let spec = &deploy_call.calls["n1"];
    assert_eq!(spec.env["conductor_node"], "n1");
    // Lock acquisition precedes the platform actions.
    assert_eq!(spec.actions.len(), 2);
    assert_eq!(spec.actions[0].scp.len(), 1);
    assert!(spec.actions[0].bash[0].starts_with("chmod +x ./deploy_mutex.sh"));
    assert!(spec.actions[0].bash[1].contains("deploy_mutex.sh lock"));
    assert!(spec.actions[0].bash[1].contains("sleep 5"));
    assert_eq!(spec.actions[1].bash, vec!["deploy n1".to_string()]);

    // The lock helper itself was scp'd with its content intact.
    let script = deploy_call
        .scp_contents
        .get("./deploy_mutex.sh")
        .expect("lock helper must be transferred");
    assert!(script.contains("mkdir \"$lock_dir\""));
}

#[tokio::test]
async fn test_why_run_uses_check_actions_and_skips_logs() {
    let fleet = FakeFleet::new(&["n1"]);
    let mut deployer = fleet.deployer.clone();
    deployer.use_why_run = true;

    deployer.deploy_for(&["n1".to_string()]).await.unwrap();

    let calls = fleet.platform("plat").recorded_calls();
    assert!(calls.contains(&"deploy_actions:n1:true".to_string()));
    assert!(calls.contains(&"pre_deploy:true".to_string()));

    let recorded = fleet.transport.recorded_calls();
    assert_eq!(recorded.len(), 1, "why-run must not upload logs");
    assert_eq!(
        recorded[0].calls["n1"].actions[1].bash,
        vec!["check n1".to_string()]
    );
}

#[tokio::test]
async fn test_branch_guard_blocks_real_deploy() {
    let fleet = FakeFleet::new(&["n1"]);
    fleet.platform("plat").set_branch("feature/x");

    let err = fleet
        .deployer
        .deploy_for(&["n1".to_string()])
        .await
        .unwrap_err();
    assert!(matches!(err, ConductorError::NotOnPrimaryBranch { .. }));
    assert!(err.to_string().contains("feature/x"));

    // Fatal before any side effect.
    let calls = fleet.platform("plat").recorded_calls();
    assert!(!calls.contains(&"package".to_string()));
    assert!(fleet.transport.recorded_calls().is_empty());
}

#[tokio::test]
async fn test_branch_guard_skipped_in_why_run_and_when_allowed() {
    let fleet = FakeFleet::new(&["n1"]);
    fleet.platform("plat").set_branch("feature/x");

    let mut check = fleet.deployer.clone();
    check.use_why_run = true;
    check.deploy_for(&["n1".to_string()]).await.unwrap();

    let mut forced = fleet.deployer.clone();
    forced.allow_non_primary_branch = true;
    forced.deploy_for(&["n1".to_string()]).await.unwrap();
}

#[tokio::test]
async fn test_force_direct_skips_delivery() {
    let fleet = FakeFleet::new(&["n1"]);
    let mut deployer = fleet.deployer.clone();
    deployer.force_direct_deploy = true;

    deployer.deploy_for(&["n1".to_string()]).await.unwrap();

    let calls = fleet.platform("plat").recorded_calls();
    assert!(calls.contains(&"package".to_string()));
    assert!(!calls.iter().any(|c| c.starts_with("deliver:")));
}

#[tokio::test]
async fn test_secrets_parsed_and_registered() {
    let fleet = FakeFleet::new(&["n1"]);
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, r#"{{"api_key": "s3cr3t"}}"#).unwrap();

    let mut deployer = fleet.deployer.clone();
    deployer.secrets = vec![file.path().to_path_buf()];
    deployer.deploy_for(&["n1".to_string()]).await.unwrap();

    let seen = fleet.platform("plat").secrets_seen.lock().unwrap().clone();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0]["api_key"], "s3cr3t");
}

#[tokio::test]
async fn test_transport_failure_is_isolated_per_host() {
    let fleet = FakeFleet::new(&["n1", "n2"]);
    fleet
        .transport
        .script_failure("n1", TransportFailure::ConnectionError);
    fleet.transport.script_success("n2", 0, "applied\n");

    let results = fleet
        .deployer
        .deploy_for(&["all".to_string()])
        .await
        .unwrap();
    assert_eq!(
        results["n1"],
        HostOutput::Failed(TransportFailure::ConnectionError)
    );
    assert!(results["n2"].is_success());
}

#[tokio::test]
async fn test_deployment_log_record_format() {
    let fleet = FakeFleet::new(&["n1"]);
    fleet.transport.script_success("n1", 0, "applied cookbook\n");

    fleet
        .deployer
        .deploy_for(&["n1".to_string()])
        .await
        .unwrap();

    let recorded = fleet.transport.recorded_calls();
    let log_call = &recorded[1];
    assert!(log_call.options.concurrent);
    let (destination, record) = log_call
        .scp_contents
        .iter()
        .next()
        .expect("log record must be transferred");
    assert!(record.contains("date: "));
    assert!(record.contains("user: admin"));
    assert!(record.contains("debug: No"));
    assert!(record.contains("repo_name: plat"));
    assert!(record.contains("commit_id: deadbeef"));
    assert!(record.contains("===== STDOUT =====\napplied cookbook"));
    assert!(record.contains("===== STDERR ====="));

    // The transfer lands in the remote user's home (transfers always run
    // before the bash lines); the elevated bash lines then create the log
    // directory and move the record into place.
    assert!(
        destination.starts_with("./"),
        "record must be staged in a user-writable path, got {destination}"
    );
    assert!(destination.ends_with("_admin"));
    let action = &log_call.calls["n1"].actions[0];
    assert_eq!(action.bash[0], "sudo mkdir -p /var/log/deployments");
    assert_eq!(
        action.bash[1],
        format!(
            "sudo mv {destination} /var/log/deployments/{}",
            destination.trim_start_matches("./")
        )
    );
}

#[tokio::test]
async fn test_failed_host_log_records_marker() {
    let fleet = FakeFleet::new(&["n1"]);
    fleet.transport.script_failure("n1", TransportFailure::Timeout);

    fleet
        .deployer
        .deploy_for(&["n1".to_string()])
        .await
        .unwrap();

    let recorded = fleet.transport.recorded_calls();
    let record = recorded[1]
        .scp_contents
        .values()
        .next()
        .expect("log record must be transferred");
    assert!(record.contains("Error: timeout"));
}

#[tokio::test]
async fn test_validate_rejects_timeout_without_why_run() {
    let fleet = FakeFleet::new(&["n1"]);
    let mut deployer = fleet.deployer.clone();
    deployer.timeout = Some(std::time::Duration::from_secs(60));

    assert!(matches!(
        deployer.validate(),
        Err(ConductorError::Configuration(_))
    ));

    deployer.use_why_run = true;
    deployer.validate().unwrap();
}

#[tokio::test]
async fn test_unknown_descriptor_is_fatal() {
    let fleet = FakeFleet::new(&["n1"]);
    let err = fleet
        .deployer
        .deploy_for(&["ghost".to_string()])
        .await
        .unwrap_err();
    assert!(err.to_string().contains("ghost"));
}
