//! Processes: scheduler tasks seen through an app.
//!
//! An app's tasks are the tasks of its stack's services plus one-off tasks
//! started by `convox.{app}`. One-off runs reuse a task definition per
//! release, remembered on the release row under `{service}.run`.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use async_trait::async_trait;
use rack_core::id::arn_to_pid;
use rack_core::{ExecOptions, Process, ProcessRunOptions, ProcessStats};
use rackplane_substrate::{
    ContainerDefinition, ContainerInstance, ContainerOverride, ExecRequest, ListTasksFilter, RunTaskRequest, Task,
    TaskDefinition,
};
use tracing::{debug, info, warn};

use crate::builds::registry_tag;
use crate::error::{ProviderError, ProviderResult};
use crate::ops::{AppOps, ClientStream, ProcessOps};
use crate::provider::Provider;
use crate::releases::RUN_DEFINITIONS;
use crate::render::upper_name;

pub(crate) const DESCRIBE_TASK_DEFINITION: &str = "describeTaskDefinition";
pub(crate) const LIST_CONTAINER_INSTANCES: &str = "listContainerInstances";

/// Task definitions are immutable once registered.
const TASK_DEFINITION_TTL: Duration = Duration::from_secs(60 * 60);
const CONTAINER_INSTANCES_TTL: Duration = Duration::from_secs(10);

const DESCRIBE_TASKS_PAGE: usize = 100;
const TASK_START_POLL: Duration = Duration::from_secs(1);
const TASK_START_TIMEOUT: Duration = Duration::from_secs(300);
/// Memory reservation for one-off runs, in MB.
const RUN_MEMORY: u64 = 512;

fn started_by(app: &str) -> String {
    format!("convox.{app}")
}

fn shell(command: &str) -> Vec<String> {
    vec!["sh".to_string(), "-c".to_string(), command.to_string()]
}

/// Truncate to four decimal places.
fn truncate(value: f64) -> f64 {
    (value * 10_000.0).trunc() / 10_000.0
}

fn definition_key(service: &str, memory: Option<u64>) -> String {
    match memory {
        Some(mb) => format!("{service}.run.{mb}"),
        None => format!("{service}.run"),
    }
}

#[async_trait]
impl ProcessOps for Provider {
    async fn process_list(&self, app: &str) -> ProviderResult<Vec<Process>> {
        let arns = self.app_task_arns(app).await?;
        let mut processes = self.task_processes(&arns).await?;
        for ps in &mut processes {
            ps.app = app.to_string();
        }
        Ok(processes)
    }

    async fn process_get(&self, app: &str, pid: &str) -> ProviderResult<Process> {
        let task = self.app_task(app, pid).await?;
        let mut process = self
            .task_processes(&[task.arn])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::not_found(format!("no such process: {pid}")))?;
        process.app = app.to_string();
        Ok(process)
    }

    async fn process_stop(&self, app: &str, pid: &str) -> ProviderResult<()> {
        let task = self.app_task(app, pid).await?;
        self.call(self.substrate().scheduler.stop_task(&task.cluster, &task.arn))
            .await?;
        info!(%app, %pid, "process stopped");
        Ok(())
    }

    async fn process_exec<S: ClientStream>(
        &self,
        app: &str,
        pid: &str,
        command: &str,
        stream: S,
        opts: ExecOptions,
    ) -> ProviderResult<i32> {
        let task = self.app_task(app, pid).await?;
        let app = self.app_get(app).await?;

        let mut cmd = shell(command);
        if app.is_gen2() {
            cmd.insert(0, "/convox-env".to_string());
        }

        let session = self
            .call(self.substrate().scheduler.exec(ExecRequest {
                cluster: task.cluster.clone(),
                task_arn: task.arn.clone(),
                command: cmd,
                tty: opts.tty,
                height: opts.height,
                width: opts.width,
            }))
            .await?;
        debug!(app = %app.name, %pid, "exec session started");

        let code = rackplane_stream::relay(stream, session.input, session.output, session.exit).await?;
        info!(app = %app.name, %pid, code, "exec finished");
        Ok(code)
    }

    async fn process_run(&self, app: &str, opts: ProcessRunOptions) -> ProviderResult<String> {
        let command = opts.command.as_deref().map(shell);
        let task = self.run_one_off(app, &opts, command).await?;
        let pid = arn_to_pid(&task.arn).to_string();
        info!(%app, service = %opts.service, %pid, "process started");
        Ok(pid)
    }

    async fn process_attach<S: ClientStream>(&self, app: &str, opts: ProcessRunOptions, stream: S) -> ProviderResult<i32> {
        let sleeper = vec!["sleep".to_string(), "3600".to_string()];
        let task = self.run_one_off(app, &opts, Some(sleeper)).await?;
        let pid = arn_to_pid(&task.arn).to_string();

        let attached = async {
            let status = self.wait_for_task(&task).await?;
            if status != "RUNNING" {
                return Err(ProviderError::internal(format!("error starting container: {status}")));
            }
            let exec = ExecOptions {
                tty: true,
                height: opts.height,
                width: opts.width,
            };
            let command = opts.command.as_deref().unwrap_or("sh");
            self.process_exec(app, &pid, command, stream, exec).await
        }
        .await;

        if let Err(e) = self.call(self.substrate().scheduler.stop_task(&task.cluster, &task.arn)).await {
            warn!(%app, %pid, error = %e, "attached process not stopped");
        }
        attached
    }

    async fn process_stats(&self, app: &str, pid: &str) -> ProviderResult<ProcessStats> {
        let task = self.app_task(app, pid).await?;
        let stats = self
            .call(self.substrate().scheduler.stats(&task.cluster, &task.arn))
            .await?;
        let memory = match stats.memory_limit {
            0 => 0.0,
            limit => stats.memory_usage as f64 / limit as f64,
        };
        Ok(ProcessStats {
            cpu_percent: truncate(stats.cpu_percent),
            memory: truncate(memory),
        })
    }

    async fn proxy<S: ClientStream>(&self, host: &str, port: u16, stream: S) -> ProviderResult<()> {
        let (sent, received) = rackplane_stream::proxy(stream, host, port).await?;
        debug!(%host, port, sent, received, "proxy closed");
        Ok(())
    }
}

impl Provider {
    // ── Cached scheduler reads ─────────────────────────────────────

    pub(crate) async fn task_definition(&self, arn: &str) -> ProviderResult<TaskDefinition> {
        let scheduler = self.substrate().scheduler.clone();
        Ok(self
            .cached(DESCRIBE_TASK_DEFINITION, arn, TASK_DEFINITION_TTL, async move {
                scheduler.describe_task_definition(arn).await
            })
            .await?)
    }

    pub async fn container_instances(&self, cluster: &str) -> ProviderResult<Vec<ContainerInstance>> {
        let scheduler = self.substrate().scheduler.clone();
        Ok(self
            .cached(LIST_CONTAINER_INSTANCES, cluster, CONTAINER_INSTANCES_TTL, async move {
                let arns = scheduler.list_container_instances(cluster).await?;
                if arns.is_empty() {
                    return Ok(Vec::new());
                }
                scheduler.describe_container_instances(cluster, &arns).await
            })
            .await?)
    }

    /// Clusters the rack runs tasks on, primary first.
    fn clusters(&self) -> Vec<&str> {
        let config = self.config();
        let mut clusters = vec![config.cluster.as_str()];
        if !config.build_cluster.is_empty() && config.build_cluster != config.cluster {
            clusters.push(config.build_cluster.as_str());
        }
        clusters
    }

    // ── Task discovery ─────────────────────────────────────────────

    /// Tasks of every scheduler service declared by `stack`.
    pub(crate) async fn stack_task_arns(&self, stack: &str) -> ProviderResult<BTreeSet<String>> {
        let scheduler = &self.substrate().scheduler;
        let cluster = &self.config().cluster;

        let services: Vec<String> = self
            .stack_resources(stack)
            .await?
            .into_iter()
            .filter(|r| matches!(r.resource_type.as_str(), "AWS::ECS::Service" | "Custom::ECSService"))
            .map(|r| r.physical_id)
            .collect();

        let mut arns = BTreeSet::new();
        for service in services {
            let filter = ListTasksFilter {
                service: Some(service),
                ..Default::default()
            };
            arns.extend(self.call(scheduler.list_tasks(cluster, filter)).await?);
        }
        Ok(arns)
    }

    async fn app_task_arns(&self, app: &str) -> ProviderResult<Vec<String>> {
        let app = self.app_get(app).await?;
        let scheduler = &self.substrate().scheduler;
        let mut arns = self.stack_task_arns(&self.rack_stack(&app.name)).await?;

        for cluster in self.clusters() {
            let filter = ListTasksFilter {
                started_by: Some(started_by(&app.name)),
                ..Default::default()
            };
            arns.extend(self.call(scheduler.list_tasks(cluster, filter)).await?);
        }
        Ok(arns.into_iter().collect())
    }

    /// The app's task behind `pid`.
    async fn app_task(&self, app: &str, pid: &str) -> ProviderResult<Task> {
        let arn = self
            .app_task_arns(app)
            .await?
            .into_iter()
            .find(|arn| arn_to_pid(arn) == pid)
            .ok_or_else(|| ProviderError::not_found(format!("no such process: {pid}")))?;
        self.describe_tasks(std::slice::from_ref(&arn))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::not_found(format!("no such process: {pid}")))
    }

    async fn describe_tasks(&self, arns: &[String]) -> ProviderResult<Vec<Task>> {
        let scheduler = &self.substrate().scheduler;
        let mut tasks = Vec::new();
        for page in arns.chunks(DESCRIBE_TASKS_PAGE) {
            for cluster in self.clusters() {
                tasks.extend(self.call(scheduler.describe_tasks(cluster, page)).await?);
            }
        }
        Ok(tasks)
    }

    pub(crate) async fn task_processes(&self, arns: &[String]) -> ProviderResult<Vec<Process>> {
        if arns.is_empty() {
            return Ok(Vec::new());
        }
        let tasks = self.describe_tasks(arns).await?;

        let mut instances: BTreeMap<String, String> = BTreeMap::new();
        for cluster in self.clusters() {
            for ci in self.container_instances(cluster).await? {
                instances.insert(ci.arn, ci.ec2_instance_id);
            }
        }
        let hosts: BTreeMap<String, String> = self
            .call(self.substrate().compute.describe_rack_instances(&self.config().rack))
            .await?
            .into_iter()
            .map(|i| (i.id, i.private_ip))
            .collect();

        let mut processes = Vec::with_capacity(tasks.len());
        for task in &tasks {
            let definition = self.task_definition(&task.task_definition_arn).await?;
            let instance = task
                .container_instance_arn
                .as_ref()
                .and_then(|arn| instances.get(arn))
                .cloned()
                .unwrap_or_default();
            let mut process = process_from_task(task, &definition)?;
            process.host = hosts.get(&instance).cloned().unwrap_or_default();
            process.instance = instance;
            processes.push(process);
        }
        processes.sort_by(|a, b| (&a.name, &a.id).cmp(&(&b.name, &b.id)));
        Ok(processes)
    }

    // ── One-off runs ───────────────────────────────────────────────

    async fn run_one_off(&self, app: &str, opts: &ProcessRunOptions, command: Option<Vec<String>>) -> ProviderResult<Task> {
        let definition = self.task_definition_for_run(app, opts).await?;

        let overrides = if command.is_some() || !opts.environment.is_empty() {
            vec![ContainerOverride {
                name: opts.service.clone(),
                command,
                environment: opts.environment.clone(),
            }]
        } else {
            Vec::new()
        };

        let result = self
            .call(self.substrate().scheduler.run_task(RunTaskRequest {
                cluster: self.config().cluster.clone(),
                task_definition: definition,
                started_by: started_by(app),
                overrides,
            }))
            .await?;

        if let Some(reason) = result.failures.first() {
            return Err(match reason.as_str() {
                "RESOURCE:MEMORY" => {
                    ProviderError::Unavailable("not enough memory available to start process".to_string())
                }
                "RESOURCE:PORTS" => {
                    ProviderError::Unavailable("no instance with available ports to start process".to_string())
                }
                other => ProviderError::internal(format!("could not start process: {other}")),
            });
        }
        match <[Task; 1]>::try_from(result.tasks) {
            Ok([task]) => Ok(task),
            Err(_) => Err(ProviderError::internal("could not start process")),
        }
    }

    /// Poll until the task leaves `PENDING`.
    async fn wait_for_task(&self, task: &Task) -> ProviderResult<String> {
        let deadline = tokio::time::Instant::now() + TASK_START_TIMEOUT;
        loop {
            let current = self
                .call(
                    self.substrate()
                        .scheduler
                        .describe_tasks(&task.cluster, std::slice::from_ref(&task.arn)),
                )
                .await?
                .into_iter()
                .next()
                .ok_or_else(|| ProviderError::internal("could not fetch process status"))?;
            if current.last_status != "PENDING" {
                return Ok(current.last_status);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ProviderError::Timeout("timeout starting process".to_string()));
            }
            if !self.context().sleep(TASK_START_POLL).await {
                return Err(ProviderError::Canceled);
            }
        }
    }

    /// Task definition for a one-off run of `opts.service`, registered once
    /// per release and remembered on the release row.
    async fn task_definition_for_run(&self, app: &str, opts: &ProcessRunOptions) -> ProviderResult<String> {
        let app = self.app_get(app).await?;
        let release_id = match opts.release.as_deref().filter(|r| !r.is_empty()) {
            Some(id) => id.to_string(),
            None if app.release.is_empty() => {
                return Err(ProviderError::validation(format!("no releases for app: {}", app.name)));
            }
            None => app.release.clone(),
        };

        let table = &self.config().dynamo_releases;
        let row = self
            .call(self.substrate().tables.get_item(table, &release_id))
            .await?
            .filter(|row| row.get("app") == Some(&app.name))
            .ok_or_else(|| ProviderError::not_found(format!("no such release: {release_id}")))?;

        let mut definitions: BTreeMap<String, String> = match row.get(RUN_DEFINITIONS) {
            Some(json) => serde_json::from_str(json)?,
            None => BTreeMap::new(),
        };
        let key = definition_key(&opts.service, opts.memory);
        if let Some(arn) = definitions.get(&key) {
            debug!(app = %app.name, release = %release_id, %key, "reusing run definition");
            return Ok(arn.clone());
        }

        let build = row.get("build").map(String::as_str).unwrap_or_default();
        if build.is_empty() {
            return Err(ProviderError::validation(format!("release {release_id} has no build")));
        }

        let upper = upper_name(&opts.service);
        let service_arn = match self.app_resource(&app.name, &format!("Service{upper}Service")).await {
            Err(e) if e.is_not_found() => self.app_resource(&app.name, &format!("Service{upper}")).await,
            other => other,
        }
        .map_err(|_| ProviderError::not_found(format!("no such service: {}", opts.service)))?;

        let cluster = &self.config().cluster;
        let service = self
            .call(
                self.substrate()
                    .scheduler
                    .describe_services(cluster, std::slice::from_ref(&service_arn)),
            )
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::internal(format!("could not look up service for process: {}", opts.service)))?;
        let current = self.task_definition(&service.task_definition).await?;
        let template = current.containers.first().ok_or_else(|| {
            ProviderError::internal(format!("could not find container definition for process: {}", opts.service))
        })?;

        let settings = self.app_resource(&app.name, "Settings").await?;
        let mut environment = template.environment.clone();
        environment.insert("RELEASE".to_string(), release_id.clone());
        environment.insert(
            "CONVOX_ENV_URL".to_string(),
            format!("s3://{settings}/releases/{release_id}/env"),
        );
        let mut labels = template.labels.clone();
        labels.insert("convox.process.type".to_string(), "oneoff".to_string());

        let memory = opts.memory.unwrap_or(RUN_MEMORY);
        let definition = TaskDefinition {
            arn: String::new(),
            family: format!("{}-{}", self.rack_stack(&app.name), opts.service),
            containers: vec![ContainerDefinition {
                name: opts.service.clone(),
                image: registry_tag(self.config(), &app, &opts.service, build),
                command: template.command.clone(),
                environment,
                labels,
                memory: i64::try_from(memory).ok(),
                cpu: template.cpu,
                port_mappings: Vec::new(),
            }],
        };

        let arn = self
            .call(self.substrate().scheduler.register_task_definition(definition))
            .await?;
        definitions.insert(key, arn.clone());
        self.call(self.substrate().tables.update_attribute(
            table,
            &release_id,
            RUN_DEFINITIONS,
            &serde_json::to_string(&definitions)?,
        ))
        .await?;
        info!(app = %app.name, release = %release_id, service = %opts.service, %arn, "run definition registered");
        Ok(arn)
    }
}

fn process_from_task(task: &Task, definition: &TaskDefinition) -> ProviderResult<Process> {
    let container = task
        .containers
        .first()
        .ok_or_else(|| ProviderError::internal(format!("invalid task: {}", task.task_definition_arn)))?;
    let spec = definition
        .containers
        .iter()
        .find(|c| c.name == container.name)
        .or_else(|| definition.containers.first())
        .cloned()
        .unwrap_or_default();

    let mut env = spec.environment.clone();
    for o in &task.overrides {
        env.extend(o.environment.clone());
    }
    let label_or_env = |label: &str, key: &str| {
        spec.labels
            .get(label)
            .filter(|v| !v.is_empty())
            .or_else(|| env.get(key))
            .cloned()
            .unwrap_or_default()
    };

    let command = task
        .overrides
        .iter()
        .find(|o| o.name == container.name)
        .and_then(|o| o.command.clone())
        .unwrap_or_else(|| spec.command.clone());

    Ok(Process {
        id: arn_to_pid(&task.arn).to_string(),
        app: label_or_env("convox.app", "APP"),
        name: container.name.clone(),
        release: label_or_env("convox.release", "RELEASE"),
        command: command.join(" "),
        host: String::new(),
        instance: String::new(),
        image: spec.image.clone(),
        ports: container
            .network_bindings
            .iter()
            .map(|p| format!("{}:{}", p.host_port, p.container_port))
            .collect(),
        memory: spec.memory.and_then(|m| u64::try_from(m).ok()).unwrap_or_default(),
        cpu: spec.cpu.and_then(|c| u64::try_from(c).ok()).unwrap_or_default(),
        status: task.last_status.to_lowercase(),
        started: task.started_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::ReleaseOps;
    use crate::testing::TestRack;
    use chrono::Utc;
    use rack_core::Release;
    use rackplane_substrate::{ComputeInstance, ContainerStats, PortMapping, Service, TaskContainer};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    const CI_ARN: &str = "arn:aws:ecs:us-east-1:000000000000:container-instance/ci-1";
    const DEF_ARN: &str = "arn:aws:ecs:us-east-1:000000000000:task-definition/convox-httpd-web:3";

    fn web_definition() -> TaskDefinition {
        TaskDefinition {
            arn: DEF_ARN.into(),
            family: "convox-httpd-web".into(),
            containers: vec![ContainerDefinition {
                name: "web".into(),
                image: "httpd:latest".into(),
                command: vec!["bin/web".into()],
                environment: BTreeMap::from([
                    ("APP".to_string(), "httpd".to_string()),
                    ("RELEASE".to_string(), "R1234".to_string()),
                ]),
                memory: Some(256),
                cpu: Some(128),
                port_mappings: vec![PortMapping {
                    host_port: 32768,
                    container_port: 80,
                }],
                ..Default::default()
            }],
        }
    }

    /// An app with one service, two running tasks, and a known instance.
    async fn running_app(rack: &TestRack) -> (String, [String; 2]) {
        rack.seed_app("httpd", "2");
        let p = &rack.provider;
        let cluster = p.config().cluster.clone();
        let service = p.app_resource("httpd", "ServiceWebService").await.unwrap();

        let cloud = &rack.cloud;
        cloud.scheduler.add_task_definition(web_definition());
        cloud.scheduler.add_service(
            &cluster,
            Service {
                arn: service.clone(),
                name: service.clone(),
                task_definition: DEF_ARN.into(),
                desired_count: 2,
                running_count: 2,
                ..Default::default()
            },
        );
        cloud.scheduler.add_container_instance(
            &cluster,
            ContainerInstance {
                arn: CI_ARN.into(),
                ec2_instance_id: "i-5bc45dc2".into(),
                agent_connected: true,
                status: "ACTIVE".into(),
                ..Default::default()
            },
        );
        cloud.compute.insert(ComputeInstance {
            id: "i-5bc45dc2".into(),
            instance_type: "t2.small".into(),
            private_ip: "10.0.1.244".into(),
            public_ip: String::new(),
            state: "running".into(),
            launch_time: None,
            spot: false,
        });

        let arns = ["5c3b5d04-9bda-4b2c-9b7e-b2e1a9c3d001", "5c3b5d04-9bda-4b2c-9b7e-b2e1a9c3d002"]
            .map(|id| cloud.scheduler.task_arn(id));
        for arn in &arns {
            cloud.scheduler.add_task(Task {
                arn: arn.clone(),
                cluster: cluster.clone(),
                task_definition_arn: DEF_ARN.into(),
                container_instance_arn: Some(CI_ARN.into()),
                last_status: "RUNNING".into(),
                desired_status: "RUNNING".into(),
                group: format!("service:{service}"),
                started_at: Some(Utc::now()),
                containers: vec![TaskContainer {
                    name: "web".into(),
                    last_status: "RUNNING".into(),
                    network_bindings: web_definition().containers[0].port_mappings.clone(),
                }],
                ..Default::default()
            });
        }
        (service, arns)
    }

    /// Save a release of build `BWEB` for the app.
    async fn save_release(rack: &TestRack) -> String {
        let mut release = Release::new("httpd");
        release.build = "BWEB".into();
        release.manifest = "services:\n  web:\n".into();
        rack.provider.release_save(&release).await.unwrap();
        release.id
    }

    #[tokio::test]
    async fn list_resolves_release_host_and_instance() {
        let rack = TestRack::new();
        let (_, arns) = running_app(&rack).await;

        let processes = rack.provider.process_list("httpd").await.unwrap();
        assert_eq!(processes.len(), 2);
        for (ps, arn) in processes.iter().zip(&arns) {
            assert_eq!(ps.id, arn_to_pid(arn));
            assert_eq!(ps.app, "httpd");
            assert_eq!(ps.name, "web");
            assert_eq!(ps.release, "R1234");
            assert_eq!(ps.host, "10.0.1.244");
            assert_eq!(ps.instance, "i-5bc45dc2");
            assert_eq!(ps.ports, ["32768:80"]);
            assert_eq!(ps.memory, 256);
            assert_eq!(ps.status, "running");
        }
    }

    #[tokio::test]
    async fn task_definitions_are_cached() {
        let rack = TestRack::new();
        running_app(&rack).await;

        rack.provider.process_list("httpd").await.unwrap();
        rack.provider.process_list("httpd").await.unwrap();
        assert_eq!(rack.cloud.scheduler.describe_definition_calls(), 1);
    }

    #[tokio::test]
    async fn get_and_stop_by_pid() {
        let rack = TestRack::new();
        let (_, arns) = running_app(&rack).await;
        let pid = arn_to_pid(&arns[1]);

        assert_eq!(rack.provider.process_get("httpd", pid).await.unwrap().id, pid);
        assert!(rack.provider.process_get("httpd", "nope").await.unwrap_err().is_not_found());

        rack.provider.process_stop("httpd", pid).await.unwrap();
        assert_eq!(rack.cloud.scheduler.stopped(), [arns[1].clone()]);
        assert!(rack.provider.process_get("httpd", pid).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn other_apps_processes_are_invisible() {
        let rack = TestRack::new();
        let (_, arns) = running_app(&rack).await;
        rack.seed_app("other", "2");
        let err = rack
            .provider
            .process_stop("other", arn_to_pid(&arns[0]))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn run_registers_one_definition_per_release() {
        let rack = TestRack::new();
        running_app(&rack).await;
        let release = save_release(&rack).await;
        let p = &rack.provider;

        let opts = ProcessRunOptions {
            service: "web".into(),
            command: Some("rake db:migrate".into()),
            release: Some(release.clone()),
            ..Default::default()
        };
        let pid = p.process_run("httpd", opts.clone()).await.unwrap();
        p.process_run("httpd", opts).await.unwrap();

        let registered = rack.cloud.scheduler.registered();
        assert_eq!(registered.len(), 1);
        let container = &registered[0].containers[0];
        let app = p.app_get("httpd").await.unwrap();
        assert_eq!(container.image, registry_tag(p.config(), &app, "web", "BWEB"));
        assert_eq!(container.command, ["bin/web"]);
        assert_eq!(container.environment["RELEASE"], release);
        assert_eq!(container.labels["convox.process.type"], "oneoff");
        assert_eq!(container.memory, Some(512));

        let runs = rack.cloud.scheduler.runs();
        assert_eq!(runs[0].started_by, "convox.httpd");
        assert_eq!(
            runs[0].overrides[0].command.as_deref(),
            Some(&["sh".to_string(), "-c".to_string(), "rake db:migrate".to_string()][..])
        );

        let listed: Vec<_> = p.process_list("httpd").await.unwrap().into_iter().map(|ps| ps.id).collect();
        assert!(listed.contains(&pid));
    }

    #[tokio::test]
    async fn placement_failure_is_reported() {
        let rack = TestRack::new();
        running_app(&rack).await;
        let release = save_release(&rack).await;
        rack.cloud.scheduler.fail_next_run("RESOURCE:MEMORY");

        let err = rack
            .provider
            .process_run(
                "httpd",
                ProcessRunOptions {
                    service: "web".into(),
                    release: Some(release),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "unavailable: not enough memory available to start process");
    }

    #[tokio::test]
    async fn run_without_a_release_is_rejected() {
        let rack = TestRack::new();
        running_app(&rack).await;
        let err = rack
            .provider
            .process_run(
                "httpd",
                ProcessRunOptions {
                    service: "web".into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Validation(_)));
    }

    #[tokio::test]
    async fn exec_relays_and_appends_the_exit_trailer() {
        let rack = TestRack::new();
        let (_, arns) = running_app(&rack).await;
        rack.cloud.scheduler.script_exec(b"total 0\n", 3);

        let (client, mut server) = tokio::io::duplex(4096);
        let pid = arn_to_pid(&arns[0]).to_string();
        let p = rack.provider.clone();
        let exec = tokio::spawn(async move { p.process_exec("httpd", &pid, "ls", client, ExecOptions::default()).await });

        server.write_all(b"input").await.unwrap();
        server.shutdown().await.unwrap();
        let mut out = Vec::new();
        server.read_to_end(&mut out).await.unwrap();

        assert_eq!(exec.await.unwrap().unwrap(), 3);
        let (body, code) = rackplane_stream::parse_trailer(&out).unwrap();
        assert_eq!(body, b"total 0\n");
        assert_eq!(code, 3);

        let request = rack.cloud.scheduler.exec_requests().pop().unwrap();
        assert_eq!(request.command, ["/convox-env", "sh", "-c", "ls"]);
    }

    #[tokio::test]
    async fn attach_stops_the_task_afterwards() {
        let rack = TestRack::new();
        running_app(&rack).await;
        let release = save_release(&rack).await;
        rack.cloud.scheduler.script_exec(b"hi\n", 0);

        let (client, mut server) = tokio::io::duplex(4096);
        server.shutdown().await.unwrap();
        let code = rack
            .provider
            .process_attach(
                "httpd",
                ProcessRunOptions {
                    service: "web".into(),
                    command: Some("echo hi".into()),
                    release: Some(release),
                    ..Default::default()
                },
                client,
            )
            .await
            .unwrap();
        assert_eq!(code, 0);

        let run = rack.cloud.scheduler.runs().pop().unwrap();
        assert_eq!(run.overrides[0].command.as_deref(), Some(&["sleep".to_string(), "3600".to_string()][..]));
        assert_eq!(rack.cloud.scheduler.stopped().len(), 1);
    }

    #[tokio::test]
    async fn stats_are_fractions() {
        let rack = TestRack::new();
        let (_, arns) = running_app(&rack).await;
        rack.cloud.scheduler.set_stats(
            &arns[0],
            ContainerStats {
                cpu_percent: 12.345678,
                memory_usage: 64,
                memory_limit: 256,
            },
        );
        let stats = rack.provider.process_stats("httpd", arn_to_pid(&arns[0])).await.unwrap();
        assert_eq!(stats.cpu_percent, 12.3456);
        assert_eq!(stats.memory, 0.25);
    }
}
