use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, anyhow};
use deploygraph::logging::init_logging;
use deploygraph::memory::{MemoryCluster, MemoryStatusStore};
use deploygraph::{
    ChartSpec, CleanupHints, CleanupParams, ClusterConnector, DeploymentGraph,
    DeploymentInputContext, DeploymentRecord, EngineConfig, StatusStore, TaskContext,
    merge_fields, run_with_cleanup,
};
use serde::{Deserialize, Serialize};

const CONFIG: &str = r#"
[engine]
node_timeout_secs = 30
cancel_on_failure = true
output_rule = { terminal = "CommitCreate" }
"#;

#[derive(Debug, Deserialize, Serialize)]
struct PostgresCreateRequest {
    name: String,
    version: String,
    storage_gb: u32,
}

/// Shared output of every postgres task; each task fills in what it created.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
struct PostgresOutput {
    postgres_id: Option<String>,
    node_group_id: Option<String>,
    namespace: Option<String>,
    secret_name: Option<String>,
    release: Option<String>,
}

merge_fields!(PostgresOutput {
    postgres_id,
    node_group_id,
    namespace,
    secret_name,
    release,
});

impl CleanupHints for PostgresOutput {
    fn resource_id(&self) -> String {
        self.postgres_id.clone().unwrap_or_default()
    }

    fn cleanup_params(&self) -> CleanupParams {
        CleanupParams {
            node_group_id: self.node_group_id.clone(),
            namespace: self.namespace.clone(),
            ..CleanupParams::default()
        }
    }
}

async fn create_node_group(ctx: TaskContext) -> anyhow::Result<PostgresOutput> {
    let name = format!("pg-{}", ctx.execution().random_suffix());
    let id = ctx.cluster().create_node_group(&name, 3).await?;
    Ok(PostgresOutput {
        node_group_id: Some(id),
        ..Default::default()
    })
}

async fn create_namespace(ctx: TaskContext) -> anyhow::Result<PostgresOutput> {
    let req: PostgresCreateRequest = ctx.input()?;
    let name = format!("{}-{}", req.name, ctx.execution().random_suffix());
    let labels = BTreeMap::from([("app".to_string(), "postgres".to_string())]);
    let namespace = ctx.cluster().create_namespace(&name, &labels).await?;
    Ok(PostgresOutput {
        namespace: Some(namespace),
        ..Default::default()
    })
}

async fn create_secret(ctx: TaskContext) -> anyhow::Result<PostgresOutput> {
    let mut out = ctx
        .merged_output::<PostgresOutput>(&["CreateNodeGroup", "CreateNamespace"])
        .context("missing upstream output")?;
    let secret_ns = ctx.config().secret_namespace.clone();
    let data = BTreeMap::from([("password".to_string(), b"changeme".to_vec())]);
    ctx.cluster()
        .create_secret(&secret_ns, ctx.deployment_id(), data)
        .await?;
    out.secret_name = Some(ctx.deployment_id().to_string());
    Ok(out)
}

async fn helm_install(ctx: TaskContext) -> anyhow::Result<PostgresOutput> {
    let req: PostgresCreateRequest = ctx.input()?;
    let mut out: PostgresOutput = ctx
        .get_output("CreateSecret")
        .context("missing secret output")?;
    let namespace = out.namespace.clone().context("namespace not created")?;

    let mut chart = ChartSpec::new(&req.name, "bitnami/postgresql", &namespace);
    chart.version = Some(req.version.clone());
    chart.values_yaml = format!("primary:\n  persistence:\n    size: {}Gi\n", req.storage_gb);
    let release = ctx.cluster().install_or_upgrade_chart(&chart).await?;
    out.release = Some(format!("{}@{}", release.name, release.revision));
    Ok(out)
}

async fn validate(ctx: TaskContext) -> anyhow::Result<PostgresOutput> {
    let out: PostgresOutput = ctx
        .get_output("HelmInstall")
        .context("missing install output")?;
    let namespace = out.namespace.clone().context("namespace not created")?;
    let command = ["psql", "-c", "select 1"].map(String::from);
    let reply = ctx
        .cluster()
        .exec_in_pod(&namespace, "postgresql-0", &command)
        .await?;
    if reply.is_empty() {
        return Err(anyhow!("validation query returned nothing"));
    }
    Ok(out)
}

async fn commit_create(ctx: TaskContext) -> anyhow::Result<PostgresOutput> {
    let mut out: PostgresOutput = ctx
        .get_output("Validate")
        .context("missing validation output")?;
    out.postgres_id = Some(ctx.deployment_id().to_string());
    Ok(out)
}

async fn create_postgres(
    id: &str,
    store: Arc<dyn StatusStore>,
    connector: Arc<dyn ClusterConnector>,
    config: EngineConfig,
) -> deploygraph::Result<String> {
    let input = DeploymentInputContext::new(id, store, connector).with_config(config);
    let mut graph = DeploymentGraph::new(input, "postgres-create").await?;
    graph.add_task("CreateNodeGroup", create_node_group, &[]);
    graph.add_task("CreateNamespace", create_namespace, &[]);
    graph.add_task(
        "CreateSecret",
        create_secret,
        &["CreateNodeGroup", "CreateNamespace"],
    );
    graph.add_task("HelmInstall", helm_install, &["CreateSecret"]);
    graph.add_task("Validate", validate, &["HelmInstall"]);
    graph.add_task("CommitCreate", commit_create, &["Validate"]);
    run_with_cleanup::<PostgresOutput>(&mut graph).await
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = EngineConfig::from_toml_str(CONFIG)?;
    init_logging(config.log_level.as_deref())?;

    let store = Arc::new(MemoryStatusStore::new());
    let cluster = Arc::new(MemoryCluster::new());
    let connector: Arc<dyn ClusterConnector> = Arc::new(Arc::clone(&cluster));

    let request = serde_json::to_vec(&PostgresCreateRequest {
        name: "orders".to_string(),
        version: "16.2.0".to_string(),
        storage_gb: 20,
    })?;

    let ok_id = "dep-3f6c1a2b-9e04-4c8a-a1d5-6b7e2f9c0d11";
    let mut record = DeploymentRecord::new(ok_id, request.clone());
    record.cloud_account_id = "acct-1".to_string();
    store.insert_deployment(record).await;

    println!("=== create postgres ===");
    let postgres_id = create_postgres(ok_id, store.clone(), connector.clone(), config.clone()).await?;
    println!("created postgres {postgres_id}");
    if let Some(record) = store.deployment(ok_id).await {
        println!("deployment status: {}", record.status);
    }

    println!("=== create postgres with a failing chart install ===");
    let failing_id = "dep-7a0d5e3c-1b2f-4d6e-8f90-a1b2c3d4e5f6";
    let mut record = DeploymentRecord::new(failing_id, request);
    record.cloud_account_id = "acct-1".to_string();
    store.insert_deployment(record).await;
    cluster.fail_on("install_or_upgrade_chart").await;

    match create_postgres(failing_id, store.clone(), connector, config).await {
        Ok(id) => println!("unexpectedly created {id}"),
        Err(e) => println!("create failed: {e}"),
    }
    let secret_ns = EngineConfig::default().secret_namespace;
    println!(
        "secret left behind: {}",
        cluster.has_secret(&secret_ns, failing_id).await
    );
    if let Some(record) = store.deployment(failing_id).await {
        println!(
            "deployment status: {} ({})",
            record.status,
            record.error_message.unwrap_or_default()
        );
    }

    Ok(())
}
