//! Scheduler phase ordering, eligibility and failure isolation.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use conductor_core::fakes::{FakeFleet, FakeInventory, FakePlatform};
use conductor_core::{
    ConductorError, HostPattern, PhaseSet, PlatformHandler, ReportPlugin, RunContext, Test,
    TestContext, TestPlugin, TestScheduler,
};

/// Plugin recording which hooks fire, in order.
struct RecordingPlugin {
    name: String,
    phases: PhaseSet,
    events: Arc<Mutex<Vec<String>>>,
    fail: bool,
    allowed_types: Option<Vec<String>>,
    allowed_hosts: Option<Vec<HostPattern>>,
}

impl RecordingPlugin {
    fn new(name: &str, phases: PhaseSet, events: Arc<Mutex<Vec<String>>>) -> Self {
        Self {
            name: name.to_string(),
            phases,
            events,
            fail: false,
            allowed_types: None,
            allowed_hosts: None,
        }
    }

    fn record(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }
}

#[async_trait]
impl TestPlugin for RecordingPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    fn phases(&self) -> PhaseSet {
        self.phases
    }

    fn allowed_platform_types(&self) -> Option<Vec<String>> {
        self.allowed_types.clone()
    }

    fn allowed_hosts(&self) -> Option<Vec<HostPattern>> {
        self.allowed_hosts.clone()
    }

    async fn check_global(&self, _ctx: &TestContext, test: &mut Test) -> anyhow::Result<()> {
        self.record(format!("global:{}", self.name));
        if self.fail {
            test.error("global check failed");
        }
        Ok(())
    }

    async fn check_platform(
        &self,
        _ctx: &TestContext,
        platform: &dyn PlatformHandler,
        _test: &mut Test,
    ) -> anyhow::Result<()> {
        self.record(format!("platform:{}:{}", self.name, platform.name()));
        Ok(())
    }

    async fn check_host(
        &self,
        _ctx: &TestContext,
        host: &str,
        _test: &mut Test,
    ) -> anyhow::Result<()> {
        self.record(format!("host:{}:{host}", self.name));
        Ok(())
    }
}

/// Plugin whose global hook always faults.
struct FaultyPlugin;

#[async_trait]
impl TestPlugin for FaultyPlugin {
    fn name(&self) -> &str {
        "faulty"
    }

    fn phases(&self) -> PhaseSet {
        PhaseSet::GLOBAL
    }

    async fn check_global(&self, _ctx: &TestContext, _test: &mut Test) -> anyhow::Result<()> {
        anyhow::bail!("panic-equivalent fault")
    }
}

/// Report capturing what it was handed.
struct CaptureReport {
    seen: Arc<Mutex<Vec<(usize, RunContext)>>>,
}

impl ReportPlugin for CaptureReport {
    fn name(&self) -> &str {
        "capture"
    }

    fn report(&self, ctx: &RunContext, tests: &[Test]) -> anyhow::Result<()> {
        self.seen.lock().unwrap().push((tests.len(), ctx.clone()));
        Ok(())
    }
}

fn events() -> Arc<Mutex<Vec<String>>> {
    Arc::new(Mutex::new(Vec::new()))
}

#[tokio::test]
async fn test_phases_run_strictly_in_order() {
    let fleet = FakeFleet::new(&["n1", "n2"]);
    let events = events();

    let all_phases = PhaseSet {
        global: true,
        platform: true,
        host: true,
        remote: false,
        check_node: false,
    };
    let mut scheduler = TestScheduler::bare(fleet.deployer.clone()).unwrap();
    scheduler
        .register_plugin(Arc::new(RecordingPlugin::new("t", all_phases, events.clone())))
        .unwrap();

    let code = scheduler
        .run_tests(&["all".to_string()])
        .await
        .unwrap();
    assert_eq!(code, 0);

    let recorded = events.lock().unwrap().clone();
    assert_eq!(
        recorded,
        vec![
            "global:t".to_string(),
            "platform:t:plat".to_string(),
            "host:t:n1".to_string(),
            "host:t:n2".to_string(),
        ]
    );
}

#[tokio::test]
async fn test_global_tests_run_without_hosts() {
    let fleet = FakeFleet::new(&["n1"]);
    let events = events();
    let mut scheduler = TestScheduler::bare(fleet.deployer.clone()).unwrap();
    scheduler
        .register_plugin(Arc::new(RecordingPlugin::new(
            "t",
            PhaseSet {
                global: true,
                platform: true,
                host: true,
                remote: false,
                check_node: false,
            },
            events.clone(),
        )))
        .unwrap();

    let code = scheduler.run_tests(&[]).await.unwrap();
    assert_eq!(code, 0);
    assert_eq!(
        events.lock().unwrap().clone(),
        vec!["global:t".to_string(), "platform:t:plat".to_string()],
        "host-scoped phases are skipped without descriptors"
    );
}

#[tokio::test]
async fn test_exit_code_reflects_recorded_errors() {
    let fleet = FakeFleet::new(&["n1"]);
    let events = events();
    let mut failing = RecordingPlugin::new("t", PhaseSet::GLOBAL, events.clone());
    failing.fail = true;

    let mut scheduler = TestScheduler::bare(fleet.deployer.clone()).unwrap();
    scheduler.register_plugin(Arc::new(failing)).unwrap();

    assert_eq!(scheduler.run_tests(&[]).await.unwrap(), 1);
}

#[tokio::test]
async fn test_plugin_fault_is_recorded_not_fatal() {
    let fleet = FakeFleet::new(&["n1"]);
    let seen = Arc::new(Mutex::new(Vec::new()));

    let mut scheduler = TestScheduler::bare(fleet.deployer.clone()).unwrap();
    scheduler.register_plugin(Arc::new(FaultyPlugin)).unwrap();
    scheduler
        .register_report(Arc::new(CaptureReport { seen: seen.clone() }))
        .unwrap();
    scheduler.requested_reports = vec!["capture".to_string()];

    let code = scheduler.run_tests(&[]).await.unwrap();
    assert_eq!(code, 1, "a faulting hook fails its test, not the run");

    let seen = seen.lock().unwrap();
    assert_eq!(seen[0].0, 1, "the faulted test is still reported");
}

#[tokio::test]
async fn test_unknown_test_and_report_names_rejected() {
    let fleet = FakeFleet::new(&["n1"]);
    let mut scheduler = TestScheduler::new(fleet.deployer.clone()).unwrap();

    scheduler.requested_tests = vec!["no_such_test".to_string()];
    let err = scheduler.run_tests(&[]).await.unwrap_err();
    assert!(matches!(err, ConductorError::UnknownTests(_)));
    assert!(err.to_string().contains("no_such_test"));

    scheduler.requested_tests = Vec::new();
    scheduler.requested_reports = vec!["no_such_report".to_string()];
    let err = scheduler.run_tests(&[]).await.unwrap_err();
    assert!(matches!(err, ConductorError::UnknownReports(_)));
}

#[tokio::test]
async fn test_builtin_plugins_and_reports_registered() {
    let fleet = FakeFleet::new(&["n1"]);
    let scheduler = TestScheduler::new(fleet.deployer.clone()).unwrap();

    let tests = scheduler.test_names();
    for name in [
        "platform_repositories",
        "repository_clean",
        "hostname",
        "deploy_from_scratch",
        "idempotence",
        "deploy_output_errors",
    ] {
        assert!(tests.contains(&name.to_string()), "missing builtin {name}");
    }
    assert_eq!(scheduler.report_names(), vec!["json", "stdout"]);
}

#[tokio::test]
async fn test_contributed_plugin_name_collision_is_fatal() {
    let events = events();
    let inventory = FakeInventory::new()
        .with_platform(Arc::new(FakePlatform::new("p1").with_type("chef")), &["n1"])
        .with_platform(
            Arc::new(FakePlatform::new("p2").with_type("ansible")),
            &["n2"],
        )
        .with_contributed_test(
            "chef",
            Arc::new(RecordingPlugin::new("dup", PhaseSet::GLOBAL, events.clone())),
        )
        .with_contributed_test(
            "ansible",
            Arc::new(RecordingPlugin::new("dup", PhaseSet::GLOBAL, events.clone())),
        );
    let fleet = FakeFleet::with_inventory(Arc::new(inventory));

    let err = TestScheduler::bare(fleet.deployer.clone()).unwrap_err();
    assert!(matches!(err, ConductorError::DuplicatePlugin { .. }));
    assert!(err.to_string().contains("dup"));
}

#[tokio::test]
async fn test_contributed_plugin_shadowing_a_builtin_is_fatal() {
    let events = events();
    let inventory = FakeInventory::new()
        .with_platform(Arc::new(FakePlatform::new("p1").with_type("chef")), &["n1"])
        .with_contributed_test(
            "chef",
            Arc::new(RecordingPlugin::new(
                "hostname",
                PhaseSet::GLOBAL,
                events.clone(),
            )),
        );
    let fleet = FakeFleet::with_inventory(Arc::new(inventory));

    // Built-ins register first, so the collision names the platform type
    // that contributed the shadowing plugin.
    let err = TestScheduler::new(fleet.deployer.clone()).unwrap_err();
    match err {
        ConductorError::DuplicatePlugin {
            name,
            platform_type,
        } => {
            assert_eq!(name, "hostname");
            assert_eq!(platform_type, "chef");
        }
        other => panic!("expected DuplicatePlugin, got {other}"),
    }
}

#[tokio::test]
async fn test_platform_type_allow_list_filters_runs() {
    let fleet = FakeFleet::new(&["n1"]);
    let events = events();
    let mut plugin = RecordingPlugin::new(
        "t",
        PhaseSet {
            global: false,
            platform: true,
            host: true,
            remote: false,
            check_node: false,
        },
        events.clone(),
    );
    plugin.allowed_types = Some(vec!["chef".to_string()]);

    let mut scheduler = TestScheduler::bare(fleet.deployer.clone()).unwrap();
    scheduler.register_plugin(Arc::new(plugin)).unwrap();

    scheduler.run_tests(&["n1".to_string()]).await.unwrap();
    assert!(
        events.lock().unwrap().is_empty(),
        "fake platform type must not match the chef allow-list"
    );
}

#[tokio::test]
async fn test_host_allow_list_filters_runs() {
    let fleet = FakeFleet::new(&["web1", "db1"]);
    let events = events();
    let mut plugin = RecordingPlugin::new("t", PhaseSet::HOST, events.clone());
    plugin.allowed_hosts = Some(vec![HostPattern::Pattern(
        regex::Regex::new(r"^web\d+$").unwrap(),
    )]);

    let mut scheduler = TestScheduler::bare(fleet.deployer.clone()).unwrap();
    scheduler.register_plugin(Arc::new(plugin)).unwrap();

    scheduler.run_tests(&["all".to_string()]).await.unwrap();
    assert_eq!(
        events.lock().unwrap().clone(),
        vec!["host:t:web1".to_string()]
    );
}
