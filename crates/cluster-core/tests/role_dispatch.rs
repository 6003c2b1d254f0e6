use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::bail;
use cluster_compute::fakes::{ComputeCall, MemoryComputeService, MemoryContextBuilder};
use cluster_core::{
    ActionConfig, ActionContext, Cluster, ClusterAction, ClusterActionEvent, ClusterActionHandler,
    ClusterError, ClusterSpec, FailureStage, FirewallRule, HandlerRegistry, InstanceTemplate,
    Phase, Statement,
};

/// Handler that records every hook it sees and can be told to fail one.
#[derive(Clone)]
struct Recorder {
    name: String,
    role: String,
    log: Arc<Mutex<Vec<String>>>,
    port: Option<u16>,
    statement: Option<String>,
    fail_at: Option<FailureStage>,
}

impl Recorder {
    fn new(role: &str, log: &Arc<Mutex<Vec<String>>>) -> Self {
        Self {
            name: role.to_string(),
            role: role.to_string(),
            log: Arc::clone(log),
            port: None,
            statement: None,
            fail_at: None,
        }
    }

    fn named(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    fn statement(mut self, line: &str) -> Self {
        self.statement = Some(line.to_string());
        self
    }

    fn failing_at(mut self, stage: FailureStage) -> Self {
        self.fail_at = Some(stage);
        self
    }

    fn note(&self, hook: &str, event: &ClusterActionEvent) {
        self.log.lock().unwrap().push(format!(
            "{}:{}@{}#{}",
            self.name,
            hook,
            event.template_index(),
            event.instances().len()
        ));
    }
}

impl ClusterActionHandler for Recorder {
    fn role(&self) -> &str {
        &self.role
    }

    fn before_action(&self, event: &mut ClusterActionEvent) -> anyhow::Result<()> {
        self.note("before", event);
        if self.fail_at == Some(FailureStage::BeforeAction) {
            bail!("{} refused to prepare", self.name);
        }
        if let Some(port) = self.port {
            event.open_port(FirewallRule::tcp(port));
        }
        Ok(())
    }

    fn action(&self, event: &mut ClusterActionEvent) -> anyhow::Result<()> {
        self.note("action", event);
        if self.fail_at == Some(FailureStage::Action) {
            bail!("{} refused to act", self.name);
        }
        if let Some(line) = &self.statement {
            event.add_statement(Statement::new(line.clone()));
        }
        Ok(())
    }

    fn after_action(&self, event: &mut ClusterActionEvent) -> anyhow::Result<()> {
        self.note("after", event);
        if self.fail_at == Some(FailureStage::AfterAction) {
            bail!("{} refused to finish", self.name);
        }
        Ok(())
    }
}

fn spec(templates: &str) -> ClusterSpec {
    ClusterSpec::builder()
        .provider("stub")
        .cluster_name("test-cluster")
        .instance_templates(InstanceTemplate::parse_list(templates).unwrap())
        .build()
}

fn harness() -> (ActionContext, Arc<MemoryComputeService>) {
    let builder = MemoryContextBuilder::new();
    let service = builder.service();
    (ActionContext::new(Arc::new(builder)), service)
}

fn logged(log: &Arc<Mutex<Vec<String>>>) -> Vec<String> {
    log.lock().unwrap().clone()
}

fn create_calls(service: &MemoryComputeService) -> Vec<ComputeCall> {
    service
        .calls()
        .into_iter()
        .filter(|c| matches!(c, ComputeCall::CreateNodes { .. }))
        .collect()
}

async fn bootstrap(
    context: ActionContext,
    registry: HandlerRegistry,
    spec: &ClusterSpec,
) -> cluster_core::Result<Option<Cluster>> {
    ClusterAction::for_phase(Phase::Bootstrap, context, Arc::new(registry))
        .execute(spec, None)
        .await
}

#[tokio::test]
async fn test_bootstrap_creates_instances_per_template() {
    cluster_core::init_tracing(false, tracing::Level::DEBUG);
    let log = Arc::new(Mutex::new(Vec::new()));
    let registry = HandlerRegistry::new()
        .with(Recorder::new("a", &log))
        .with(Recorder::new("b", &log))
        .with(Recorder::new("c", &log));
    let (context, service) = harness();
    let spec = spec("1 a+b,2 c");

    let cluster = bootstrap(context, registry, &spec).await.unwrap().unwrap();

    assert_eq!(cluster.len(), 3);
    assert_eq!(cluster.instances_with_role("a").count(), 1);
    assert_eq!(cluster.instances_with_role("b").count(), 1);
    assert_eq!(cluster.instances_with_role("c").count(), 2);
    assert_eq!(cluster.spec_digest(), spec.digest());
    assert_eq!(create_calls(&service).len(), 2);
}

#[tokio::test]
async fn test_bootstrap_conserves_total_instance_count() {
    let (context, _) = harness();
    let spec = spec("2 a,3 b,1 a+c,4 d+e+f");

    let cluster = bootstrap(context, HandlerRegistry::new(), &spec)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(cluster.len() as u64, spec.total_instance_count());
    assert_eq!(cluster.instances_with_role("a").count(), 3);
}

#[tokio::test]
async fn test_role_without_handlers_still_gets_instances() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let registry = HandlerRegistry::new().with(Recorder::new("a", &log));
    let (context, _) = harness();

    let cluster = bootstrap(context, registry, &spec("1 a,2 z"))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(cluster.instances_with_role("z").count(), 2);
    assert!(logged(&log).iter().all(|line| line.starts_with("a:")));
}

#[tokio::test]
async fn test_zero_count_template_fails_before_provider_calls() {
    let (context, service) = harness();
    let spec = ClusterSpec::builder()
        .provider("stub")
        .cluster_name("test-cluster")
        .instance_template(InstanceTemplate::new(0, ["a"]))
        .build();

    let err = bootstrap(context, HandlerRegistry::new(), &spec)
        .await
        .unwrap_err();

    assert!(err.is_configuration());
    assert!(service.calls().is_empty());
}

#[tokio::test]
async fn test_configure_requires_existing_cluster() {
    let (context, service) = harness();
    let err = ClusterAction::for_phase(Phase::Configure, context, Arc::new(HandlerRegistry::new()))
        .execute(&spec("1 a"), None)
        .await
        .unwrap_err();

    assert!(err.is_configuration());
    assert!(service.calls().is_empty());
}

#[tokio::test]
async fn test_invalid_concurrency_property_is_configuration_error() {
    let (context, service) = harness();
    let spec = ClusterSpec::builder()
        .provider("stub")
        .cluster_name("test-cluster")
        .instance_templates(InstanceTemplate::parse_list("1 a").unwrap())
        .property(cluster_core::MAX_CONCURRENCY_KEY, "0")
        .build();

    let err = bootstrap(context, HandlerRegistry::new(), &spec)
        .await
        .unwrap_err();
    assert!(err.is_configuration());
    assert!(service.calls().is_empty());
}

#[tokio::test]
async fn test_failing_role_is_reported_while_siblings_complete() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let registry = HandlerRegistry::new()
        .with(Recorder::new("r", &log).failing_at(FailureStage::Action))
        .with(Recorder::new("s", &log));
    let (context, service) = harness();

    let err = bootstrap(context, registry, &spec("1 r,2 s"))
        .await
        .unwrap_err();

    assert_eq!(err.failed_roles(), vec!["r"]);
    assert!(err.partial_cluster().is_none());
    match &err {
        ClusterError::Provisioning { failures, .. } => {
            assert_eq!(failures.len(), 1);
            assert_eq!(failures[0].stage, FailureStage::Action);
            assert!(failures[0].reason.contains("refused to act"));
        }
        other => panic!("expected provisioning error, got {other:?}"),
    }

    let calls = create_calls(&service);
    assert_eq!(calls.len(), 1);
    assert!(matches!(&calls[0], ComputeCall::CreateNodes { count: 2, .. }));

    let lines = logged(&log);
    assert!(lines.contains(&"s:after@1#2".to_string()));
    assert!(!lines.iter().any(|l| l.starts_with("r:after")));
}

#[tokio::test]
async fn test_failure_blocks_siblings_sharing_the_template() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let registry = HandlerRegistry::new()
        .with(Recorder::new("r", &log).failing_at(FailureStage::BeforeAction))
        .with(Recorder::new("s", &log));
    let (context, service) = harness();

    let err = bootstrap(context, registry, &spec("1 r+s"))
        .await
        .unwrap_err();

    assert_eq!(err.failed_roles(), vec!["r"]);
    assert!(create_calls(&service).is_empty());

    let lines = logged(&log);
    assert!(lines.contains(&"s:action@0#0".to_string()));
    assert!(!lines.iter().any(|l| l.contains(":after")));
    assert!(!lines.iter().any(|l| l.starts_with("r:action")));
}

#[tokio::test]
async fn test_provider_rejection_names_the_role_group() {
    let registry = HandlerRegistry::new();
    let (context, service) = harness();
    service.reject_create_for_role("db");

    let err = bootstrap(context, registry, &spec("1 web,2 db"))
        .await
        .unwrap_err();

    assert_eq!(err.failed_roles(), vec!["db"]);
    match err {
        ClusterError::Provisioning { failures, .. } => {
            assert!(failures.iter().all(|f| f.stage == FailureStage::Realize));
        }
        other => panic!("expected provisioning error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_after_action_failure_is_reported() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let registry =
        HandlerRegistry::new().with(Recorder::new("a", &log).failing_at(FailureStage::AfterAction));
    let (context, _) = harness();

    let err = bootstrap(context, registry, &spec("1 a"))
        .await
        .unwrap_err();

    assert_eq!(err.failed_roles(), vec!["a"]);
}

#[tokio::test]
async fn test_handlers_run_in_registration_order() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let registry = HandlerRegistry::new()
        .with(Recorder::new("a", &log).named("first"))
        .with(Recorder::new("a", &log).named("second"));
    let (context, _) = harness();

    bootstrap(context, registry, &spec("1 a")).await.unwrap();

    assert_eq!(
        logged(&log),
        vec![
            "first:before@0#0",
            "second:before@0#0",
            "first:action@0#0",
            "second:action@0#0",
            "first:after@0#1",
            "second:after@0#1",
        ]
    );
}

#[tokio::test]
async fn test_role_dispatched_once_per_template_occurrence() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let registry = HandlerRegistry::new().with(Recorder::new("a", &log));
    let (context, _) = harness();

    bootstrap(context, registry, &spec("1 a,2 a+b"))
        .await
        .unwrap();

    let mut befores: Vec<String> = logged(&log)
        .into_iter()
        .filter(|l| l.starts_with("a:before"))
        .collect();
    befores.sort();
    assert_eq!(befores, vec!["a:before@0#0", "a:before@1#0"]);

    let mut afters: Vec<String> = logged(&log)
        .into_iter()
        .filter(|l| l.starts_with("a:after"))
        .collect();
    afters.sort();
    assert_eq!(afters, vec!["a:after@0#1", "a:after@1#2"]);
}

#[tokio::test]
async fn test_rules_and_statements_stay_with_their_role_group() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let registry = HandlerRegistry::new()
        .with(Recorder::new("web", &log).port(80).statement("install web"))
        .with(Recorder::new("db", &log).port(5432).statement("install db"));
    let (context, service) = harness();

    let cluster = bootstrap(context, registry, &spec("1 web,1 db"))
        .await
        .unwrap()
        .unwrap();

    let web = cluster.instances_with_role("web").next().unwrap();
    let db = cluster.instances_with_role("db").next().unwrap();

    assert_eq!(service.ingress_for(&web.id), vec![FirewallRule::tcp(80)]);
    assert_eq!(service.ingress_for(&db.id), vec![FirewallRule::tcp(5432)]);
    assert_eq!(service.scripts_for(&web.id)[0].render(), "install web");
    assert_eq!(service.scripts_for(&db.id)[0].render(), "install db");
}

#[tokio::test]
async fn test_single_worker_pool_still_runs_every_role() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let registry = HandlerRegistry::new()
        .with(Recorder::new("a", &log))
        .with(Recorder::new("b", &log))
        .with(Recorder::new("c", &log));
    let (context, _) = harness();
    let context = context.with_config(ActionConfig { max_concurrency: 1 });

    let cluster = bootstrap(context, registry, &spec("1 a,1 b,1 c"))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(cluster.len(), 3);
    assert_eq!(
        logged(&log).iter().filter(|l| l.contains(":after")).count(),
        3
    );
}

#[tokio::test(start_paused = true)]
async fn test_single_worker_pool_serializes_realizations() {
    let (context, service) = harness();
    service.set_latency(Duration::from_millis(100));
    let context = context.with_config(ActionConfig { max_concurrency: 1 });

    let started = tokio::time::Instant::now();
    let cluster = bootstrap(context, HandlerRegistry::new(), &spec("1 a,1 b"))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(cluster.len(), 2);
    assert_eq!(create_calls(&service).len(), 2);
    assert_eq!(service.peak_in_flight(), 1);
    assert!(started.elapsed() >= Duration::from_millis(200));
}

#[tokio::test(start_paused = true)]
async fn test_pool_grows_to_the_number_of_distinct_roles() {
    let (context, service) = harness();
    service.set_latency(Duration::from_millis(100));
    let context = context.with_config(ActionConfig { max_concurrency: 8 });

    bootstrap(context, HandlerRegistry::new(), &spec("1 a,1 b"))
        .await
        .unwrap();

    assert_eq!(service.peak_in_flight(), 2);
}

#[tokio::test]
async fn test_configure_runs_scripts_on_existing_group_instances() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let spec = spec("2 web,1 db");
    let (context, service) = harness();
    let cluster = bootstrap(context.clone(), HandlerRegistry::new(), &spec)
        .await
        .unwrap()
        .unwrap();

    let registry = HandlerRegistry::new()
        .with(Recorder::new("web", &log).port(8080).statement("configure web"));
    let configured = ClusterAction::for_phase(Phase::Configure, context, Arc::new(registry))
        .execute(&spec, Some(&cluster))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(configured.len(), 3);
    for web in configured.instances_with_role("web") {
        let scripts = service.scripts_for(&web.id);
        assert_eq!(scripts.last().unwrap().render(), "configure web");
        assert!(service.ingress_for(&web.id).contains(&FirewallRule::tcp(8080)));
    }
    let db = configured.instances_with_role("db").next().unwrap();
    assert!(service.scripts_for(&db.id).is_empty());
}

#[tokio::test]
async fn test_failed_script_fails_the_role() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let spec = spec("1 web,1 db");
    let (context, service) = harness();
    let cluster = bootstrap(context.clone(), HandlerRegistry::new(), &spec)
        .await
        .unwrap()
        .unwrap();
    service.fail_scripts_for_role("db", 3);

    let registry = HandlerRegistry::new()
        .with(Recorder::new("web", &log).statement("start web"))
        .with(Recorder::new("db", &log).statement("start db"));
    let err = ClusterAction::for_phase(Phase::Start, context, Arc::new(registry))
        .execute(&spec, Some(&cluster))
        .await
        .unwrap_err();

    assert_eq!(err.failed_roles(), vec!["db"]);
    assert!(err.to_string().contains("status 3"));
    assert!(logged(&log).iter().any(|l| l.starts_with("web:after")));
}

/// Opens one port and records how many rules and statements its own event
/// holds at every hook.
struct Isolated {
    role: String,
    port: u16,
    seen: Arc<Mutex<Vec<(String, usize, usize)>>>,
}

impl Isolated {
    fn record(&self, event: &ClusterActionEvent) {
        self.seen.lock().unwrap().push((
            self.role.clone(),
            event.firewall_rules().len(),
            event.statements().len(),
        ));
    }
}

impl ClusterActionHandler for Isolated {
    fn role(&self) -> &str {
        &self.role
    }

    fn before_action(&self, event: &mut ClusterActionEvent) -> anyhow::Result<()> {
        self.record(event);
        event.open_port(FirewallRule::tcp(self.port));
        Ok(())
    }

    fn action(&self, event: &mut ClusterActionEvent) -> anyhow::Result<()> {
        event.add_statement(Statement::new(format!("install {}", self.role)));
        Ok(())
    }

    fn after_action(&self, event: &mut ClusterActionEvent) -> anyhow::Result<()> {
        self.record(event);
        assert!(event.firewall_rules().contains(&FirewallRule::tcp(self.port)));
        Ok(())
    }
}

#[tokio::test]
async fn test_events_never_see_other_roles_accumulators() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut registry = HandlerRegistry::new();
    for (role, port) in [("a", 1000), ("b", 2000), ("c", 3000)] {
        registry.register(Arc::new(Isolated {
            role: role.to_string(),
            port,
            seen: Arc::clone(&seen),
        }));
    }
    let (context, _) = harness();

    bootstrap(context, registry, &spec("1 a+b,1 c")).await.unwrap();

    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen.len(), 6);
    for (role, rules, statements) in seen {
        assert!(rules <= 1, "{role} saw {rules} rules");
        assert!(statements <= 1, "{role} saw {statements} statements");
    }
}
