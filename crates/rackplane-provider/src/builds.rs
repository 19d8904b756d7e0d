//! The build pipeline.
//!
//! ```text
//!   build_create ──▶ row (created) ──▶ stage source ──▶ BuildRunner::start
//!                                                           │
//!                      spawned waiter ◀─────────────────────┘
//!                        │  drain stdout, wait ≤ BUILD_TIMEOUT
//!                        │  reload row (callbacks may have finished it)
//!                        ▼
//!                      final status + logs saved, build:create event
//! ```

use std::collections::BTreeMap;
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rack_core::time::{from_sortable, to_sortable};
use rack_core::{
    App, Build, BuildCreateOptions, BuildSource, BuildStatus, BuildUpdateOptions, Config, Event, Release,
    ServiceIndex,
};
use rackplane_substrate::registry::BATCH_DELETE_IMAGE_LIMIT;
use rackplane_substrate::{BuildSpec, Item};
use regex::Regex;
use tempfile::TempDir;
use tokio::io::AsyncReadExt;
use tracing::{debug, error, info, warn};

use crate::context::CallContext;
use crate::error::{ProviderError, ProviderResult};
use crate::ops::{AppOps, BuildOps, IndexOps, RegistryOps, ReleaseOps};
use crate::provider::Provider;

/// Hard ceiling on one build container, independent of the caller.
pub const BUILD_TIMEOUT: Duration = Duration::from_secs(60 * 60);

const BUILD_IMAGE: &str = "convox/api";

static ECR_IMAGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d+)\.dkr\.ecr\.([^.]+)\.amazonaws\.com/([^:]+):(\S+)$").expect("image pattern compiles")
});

/// Fully qualified image for one service of a build.
///
/// Apps with a registry id push to their private repository as
/// `{repo}:{service}.{build}`; older apps push to the rack registry host.
pub fn registry_tag(config: &Config, app: &App, service: &str, build_id: &str) -> String {
    match app.output("RegistryId") {
        "" => format!("{}/{}-{service}:{build_id}", config.registry_host, app.name),
        registry_id => format!(
            "{registry_id}.dkr.ecr.{}.amazonaws.com/{}:{service}.{build_id}",
            config.region,
            app.output("RegistryRepository")
        ),
    }
}

/// Object key of a build's captured output.
pub(crate) fn build_log_key(id: &str) -> String {
    format!("builds/{id}.log")
}

// ── Row codec ──────────────────────────────────────────────────────

fn build_to_item(build: &Build) -> Item {
    let mut item = Item::new();
    item.insert("id".into(), build.id.clone());
    item.insert("app".into(), build.app.clone());
    item.insert("status".into(), build.status.as_str().to_string());
    item.insert("created".into(), to_sortable(&build.started));
    let optional = [
        ("description", &build.description),
        ("manifest", &build.manifest),
        ("release", &build.release),
        ("reason", &build.reason),
        ("logs", &build.logs),
    ];
    for (key, value) in optional {
        if !value.is_empty() {
            item.insert(key.into(), value.clone());
        }
    }
    if let Some(ended) = &build.ended {
        item.insert("ended".into(), to_sortable(ended));
    }
    if !build.tags.is_empty() {
        if let Ok(tags) = serde_json::to_string(&build.tags) {
            item.insert("tags".into(), tags);
        }
    }
    item
}

fn build_from_item(item: &Item) -> Build {
    let attr = |key: &str| item.get(key).cloned().unwrap_or_default();
    Build {
        id: attr("id"),
        app: attr("app"),
        description: attr("description"),
        logs: attr("logs"),
        manifest: attr("manifest"),
        release: attr("release"),
        reason: attr("reason"),
        status: item
            .get("status")
            .and_then(|s| s.parse().ok())
            .unwrap_or(BuildStatus::Created),
        started: item
            .get("created")
            .and_then(|s| from_sortable(s))
            .unwrap_or_default(),
        ended: item.get("ended").and_then(|s| from_sortable(s)),
        tags: item
            .get("tags")
            .and_then(|t| serde_json::from_str(t).ok())
            .unwrap_or_default(),
    }
}

/// What the build container reads its source from.
enum Staged {
    Url(String),
    Stdin(Vec<u8>),
    /// Kept alive until the container exits.
    Dir(TempDir),
}

impl Staged {
    fn source_arg(&self) -> String {
        match self {
            Self::Url(url) => url.clone(),
            Self::Stdin(_) => "-".to_string(),
            Self::Dir(dir) => dir.path().to_string_lossy().into_owned(),
        }
    }
}

#[async_trait]
impl BuildOps for Provider {
    async fn build_create(&self, app: &str, source: BuildSource, opts: BuildCreateOptions) -> ProviderResult<Build> {
        let app = self.app_get(app).await?;
        let build = self.new_build(&app, &opts).await?;
        let staged = self.stage(source).await;
        self.launch(&app, build, staged, &opts).await
    }

    async fn build_get(&self, app: &str, id: &str) -> ProviderResult<Build> {
        let table = &self.config().dynamo_builds;
        let item = self
            .call(self.substrate().tables.get_item(table, id))
            .await?
            .ok_or_else(|| ProviderError::not_found(format!("no such build: {id}")))?;
        let build = build_from_item(&item);
        if build.app != app {
            return Err(ProviderError::not_found(format!("no such build: {id}")));
        }
        Ok(build)
    }

    async fn build_list(&self, app: &str, limit: usize) -> ProviderResult<Vec<Build>> {
        let app = self.app_get(app).await?;
        let rows = self
            .call(
                self.substrate()
                    .tables
                    .query_app(&self.config().dynamo_builds, &app.name, Some(limit), true),
            )
            .await?;
        Ok(rows.iter().map(build_from_item).collect())
    }

    async fn build_delete(&self, app: &str, id: &str) -> ProviderResult<Build> {
        let build = self.build_get(app, id).await?;
        let app = self.app_get(app).await?;

        if !app.release.is_empty() {
            let active = self.release_get(&app.name, &app.release).await?;
            if active.build == build.id {
                return Err(ProviderError::InUse(format!(
                    "cannot delete build contained in active release: {}",
                    app.release
                )));
            }
        }

        self.call(self.substrate().tables.delete_item(&self.config().dynamo_builds, id))
            .await?;
        info!(app = %app.name, build = %id, "build deleted");

        self.delete_build_images(&app, &build).await?;
        Ok(build)
    }

    async fn build_logs(&self, app: &str, id: &str) -> ProviderResult<String> {
        let app = self.app_get(app).await?;
        match self
            .call(self.substrate().objects.get(app.output("Settings"), &build_log_key(id)))
            .await
        {
            Ok(body) => Ok(String::from_utf8_lossy(&body).into_owned()),
            Err(e) if e.is_code("NoSuchKey") => Ok(String::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn build_save(&self, build: &Build) -> ProviderResult<()> {
        if build.id.is_empty() {
            return Err(ProviderError::validation("build id can not be blank"));
        }
        let app = self.app_get(&build.app).await?;
        let table = &self.config().dynamo_builds;
        let tables = &self.substrate().tables;

        let mut item = build_to_item(build);

        if let Some(existing) = self.call(tables.get_item(table, &build.id)).await? {
            if let Some(created) = existing.get("created") {
                item.insert("created".into(), created.clone());
            }
            let previous = build_from_item(&existing);
            if previous.status.is_terminal() && previous.status != build.status {
                debug!(build = %build.id, status = %previous.status.as_str(), "terminal status kept");
                item.insert("status".into(), previous.status.as_str().to_string());
            }
        }

        if !build.logs.is_empty() && !build.logs.contains("://") {
            let key = build_log_key(&build.id);
            self.call(self.substrate().objects.put(
                app.output("Settings"),
                &key,
                build.logs.clone().into_bytes(),
                false,
            ))
            .await?;
            item.insert("logs".into(), format!("object://{}/{key}", app.name));
        }

        self.call(tables.put_item(table, item)).await?;
        debug!(app = %build.app, build = %build.id, status = %build.status.as_str(), "build saved");
        Ok(())
    }

    async fn build_update(&self, app: &str, id: &str, opts: BuildUpdateOptions) -> ProviderResult<Build> {
        let mut build = self.build_get(app, id).await?;

        if build.status.is_terminal() && (opts.status.is_some() || opts.manifest.is_some()) {
            return Err(ProviderError::Conflict(format!(
                "build {id} is already {}",
                build.status.as_str()
            )));
        }

        if let Some(status) = opts.status {
            build.status = status;
        }
        if let Some(manifest) = opts.manifest {
            build.manifest = manifest;
        }
        if let Some(release) = opts.release {
            build.release = release;
        }
        if let Some(reason) = opts.reason {
            build.reason = reason;
        }
        if let Some(ended) = opts.ended {
            build.ended = Some(ended);
        }

        self.build_save(&build).await?;
        info!(%app, build = %id, status = %build.status.as_str(), "build updated");
        Ok(build)
    }

    async fn build_release(&self, build: &Build) -> ProviderResult<Release> {
        let mut release = match self.latest_release(&build.app).await? {
            Some(latest) => latest,
            None => Release::new(&build.app),
        };
        release.id = rack_core::id::release_id();
        release.created = Utc::now();
        release.build = build.id.clone();
        release.manifest = build.manifest.clone();

        self.release_save(&release).await?;

        let mut build = build.clone();
        build.release = release.id.clone();
        self.build_save(&build).await?;

        info!(app = %release.app, release = %release.id, build = %build.id, "release created from build");
        let event = Event::new("release:create").with("app", &release.app).with("id", &release.id);
        self.notify(event, None).await;
        Ok(release)
    }

    async fn build_copy(&self, src_app: &str, id: &str, dest_app: &str) -> ProviderResult<Build> {
        let src = self.app_get(src_app).await?;
        let build = self.build_get(src_app, id).await?;
        let dest = self.app_get(dest_app).await?;

        let services = ServiceIndex::parse(&build.manifest);
        if services.is_empty() {
            return Err(ProviderError::validation(format!("build {id} has no services to copy")));
        }

        let mut manifest = String::from("services:\n");
        for service in services.services() {
            manifest.push_str(&format!("  {}:\n", service.name));
            manifest.push_str(&format!(
                "    image: {}\n",
                registry_tag(self.config(), &src, &service.name, &build.id)
            ));
            if service.agent {
                manifest.push_str("    agent: true\n");
            }
        }

        let dir = tempfile::Builder::new().prefix("source").tempdir()?;
        tokio::fs::write(dir.path().join("convox.yml"), manifest).await?;

        let opts = BuildCreateOptions {
            manifest: Some("convox.yml".to_string()),
            description: format!("Copy of {} {}", src.name, build.id),
            ..Default::default()
        };
        let copy = self.new_build(&dest, &opts).await?;
        self.launch(&dest, copy, Ok(Staged::Dir(dir)), &opts).await
    }
}

impl Provider {
    /// Record a build before anything else can fail.
    async fn new_build(&self, app: &App, opts: &BuildCreateOptions) -> ProviderResult<Build> {
        let mut build = Build::new(&app.name);
        build.description = opts.description.clone();
        self.build_save(&build).await?;
        info!(app = %app.name, build = %build.id, "build created");
        Ok(build)
    }

    async fn stage(&self, source: BuildSource) -> ProviderResult<Staged> {
        Ok(match source {
            BuildSource::Url(url) => Staged::Url(url),
            BuildSource::Tar(data) => Staged::Stdin(data),
            BuildSource::Index(index) => {
                let dir = tempfile::Builder::new().prefix("source").tempdir()?;
                self.index_download(&index, dir.path()).await?;
                Staged::Dir(dir)
            }
        })
    }

    /// Start the container; a start failure finalizes the build as failed.
    async fn launch(
        &self,
        app: &App,
        mut build: Build,
        staged: ProviderResult<Staged>,
        opts: &BuildCreateOptions,
    ) -> ProviderResult<Build> {
        let started = match staged {
            Ok(staged) => self.run_build(app, &build, staged, opts).await,
            Err(e) => Err(e),
        };
        let Err(e) = started else {
            return Ok(build);
        };

        error!(app = %app.name, build = %build.id, error = %e, "build failed to start");
        build.status = BuildStatus::Failed;
        build.reason = e.to_string();
        build.ended = Some(Utc::now());
        if let Err(save) = self.build_save(&build).await {
            warn!(build = %build.id, error = %save, "failed build not recorded");
        }
        let event = Event::new("build:create").with("app", &build.app).with("id", &build.id);
        self.notify(event, Some(&e)).await;
        Err(e)
    }

    /// Start the build container and hand it to a detached waiter.
    async fn run_build(&self, app: &App, build: &Build, staged: Staged, opts: &BuildCreateOptions) -> ProviderResult<()> {
        let env = self.build_env(app, build, opts).await?;
        let name = format!("build-{}", build.id);
        let stdin = match &staged {
            Staged::Stdin(data) => Some(data.clone()),
            _ => None,
        };

        let spec = BuildSpec {
            name: name.clone(),
            image: format!("{BUILD_IMAGE}:{}", self.config().version),
            args: vec!["build".to_string(), staged.source_arg()],
            env,
            stdin,
        };

        let running = self.call(self.substrate().builds.start(spec)).await?;
        debug!(app = %app.name, build = %build.id, "build container started");

        let waiter = self.with_context(CallContext::new());
        let app_name = app.name.clone();
        let id = build.id.clone();
        tokio::spawn(async move {
            let _source = staged;
            waiter.finish_build(&app_name, &id, &name, running).await;
        });
        Ok(())
    }

    async fn build_env(
        &self,
        app: &App,
        build: &Build,
        opts: &BuildCreateOptions,
    ) -> ProviderResult<BTreeMap<String, String>> {
        let config = self.config();

        let (mut username, mut password, mut address) = (
            "convox".to_string(),
            config.password.clone().unwrap_or_default(),
            config.registry_host.clone(),
        );
        let registry_id = app.output("RegistryId");
        if !registry_id.is_empty() {
            let auth = self
                .call(self.substrate().registry.authorization_token(registry_id))
                .await?;
            username = auth.username;
            password = auth.password;
            address = auth
                .endpoint
                .trim_start_matches("https://")
                .trim_start_matches("http://")
                .to_string();
        }

        let mut auths = serde_json::Map::new();
        for registry in self.registry_list().await? {
            auths.insert(
                registry.server.clone(),
                serde_json::json!({ "username": registry.username, "password": registry.password }),
            );
        }

        let manifest = opts.manifest.clone().unwrap_or_else(|| {
            if app.is_gen2() { "convox.yml" } else { "docker-compose.yml" }.to_string()
        });

        let mut env = BTreeMap::from([
            ("APP".to_string(), app.name.clone()),
            ("BUILD".to_string(), build.id.clone()),
            ("DOCKER_AUTH".to_string(), serde_json::Value::Object(auths).to_string()),
            ("MANIFEST_PATH".to_string(), manifest),
            ("PUSH".to_string(), registry_tag(config, app, "{service}", &build.id)),
            ("RACK_HOST".to_string(), config.notification_host.clone()),
            ("RACK_PASSWORD".to_string(), config.password.clone().unwrap_or_default()),
            ("REGISTRY_ADDRESS".to_string(), address),
            ("REGISTRY_PASSWORD".to_string(), password),
            ("REGISTRY_USERNAME".to_string(), username),
            ("REPOSITORY".to_string(), app.output("RegistryRepository").to_string()),
        ]);
        if !opts.cache {
            env.insert("NO_CACHE".to_string(), "true".to_string());
        }
        if opts.development || config.development {
            env.insert("DEVELOPMENT".to_string(), "true".to_string());
        }
        Ok(env)
    }

    /// Drain the container, settle the final status, and save logs.
    async fn finish_build(&self, app: &str, id: &str, container: &str, running: rackplane_substrate::RunningBuild) {
        let rackplane_substrate::RunningBuild { mut stdout, wait } = running;
        let mut output = Vec::new();

        let outcome = tokio::time::timeout(BUILD_TIMEOUT, async {
            if let Err(e) = stdout.read_to_end(&mut output).await {
                warn!(build = %id, error = %e, "build output interrupted");
            }
            wait.await
        })
        .await;

        let inferred = match outcome {
            Ok(Ok(0)) => (BuildStatus::Complete, String::new()),
            Ok(Ok(code)) => (BuildStatus::Failed, format!("build exited with code {code}")),
            Ok(Err(e)) => (BuildStatus::Failed, e.to_string()),
            Err(_) => {
                warn!(build = %id, "build timed out, killing container");
                if let Err(e) = self.call(self.substrate().builds.kill(container)).await {
                    warn!(build = %id, error = %e, "build container kill failed");
                }
                (BuildStatus::Timeout, "build timed out".to_string())
            }
        };

        let mut build = match self.build_get(app, id).await {
            Ok(build) => build,
            Err(e) => {
                error!(build = %id, error = %e, "build vanished before it finished");
                return;
            }
        };

        if !build.status.is_terminal() || inferred.0 == BuildStatus::Timeout {
            build.status = inferred.0;
            if build.reason.is_empty() {
                build.reason = inferred.1;
            }
        }
        build.ended.get_or_insert_with(Utc::now);
        build.logs = String::from_utf8_lossy(&output).into_owned();

        let saved = self.build_save(&build).await;
        if let Err(e) = &saved {
            error!(build = %id, error = %e, "final build state not saved");
        }
        info!(%app, build = %id, status = %build.status.as_str(), "build finished");

        let event = Event::new("build:create")
            .with("app", app)
            .with("id", id)
            .with("status", build.status.as_str());
        let failure = match build.status {
            BuildStatus::Complete => None,
            _ => Some(ProviderError::internal(build.reason.clone())),
        };
        self.notify(event, failure.as_ref().or(saved.as_ref().err())).await;
    }

    /// Remove every service image of a build from its registry.
    async fn delete_build_images(&self, app: &App, build: &Build) -> ProviderResult<()> {
        let services = ServiceIndex::parse(&build.manifest);
        if services.is_empty() {
            return Ok(());
        }

        let mut registry = String::new();
        let mut repository = String::new();
        let mut tags = Vec::new();
        for service in services.names() {
            let url = registry_tag(self.config(), app, service, &build.id);
            let caps = ECR_IMAGE
                .captures(&url)
                .ok_or_else(|| ProviderError::internal(format!("image url is not a valid registry url: {url}")))?;
            registry = caps[1].to_string();
            repository = caps[3].to_string();
            tags.push(caps[4].to_string());
        }

        for chunk in tags.chunks(BATCH_DELETE_IMAGE_LIMIT) {
            self.call(self.substrate().registry.batch_delete_image(&registry, &repository, chunk))
                .await?;
        }
        debug!(app = %app.name, build = %build.id, images = tags.len(), "build images deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ACCOUNT, TestRack};
    use rack_core::Index;
    use rackplane_substrate::memory::BuildOutcome;

    async fn settle(rack: &TestRack, id: &str) -> Build {
        for _ in 0..200 {
            let build = rack.provider.build_get("httpd", id).await.unwrap();
            if build.status.is_terminal() {
                return build;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("build {id} never finished");
    }

    fn row(id: &str, status: &str, manifest: &str) -> Item {
        Item::from([
            ("id".to_string(), id.to_string()),
            ("app".to_string(), "httpd".to_string()),
            ("status".to_string(), status.to_string()),
            ("created".to_string(), "20170101.120000.000000000".to_string()),
            ("manifest".to_string(), manifest.to_string()),
        ])
    }

    #[test]
    fn registry_tags_by_registry_kind() {
        let config = Config::local("convox");
        let mut app = App {
            name: "httpd".into(),
            ..Default::default()
        };
        assert_eq!(registry_tag(&config, &app, "web", "BABC"), "registry.convox.local/httpd-web:BABC");

        app.outputs.insert("RegistryId".into(), "778743527532".into());
        app.outputs.insert("RegistryRepository".into(), "convox-httpd-hqvvfosgxt".into());
        assert_eq!(
            registry_tag(&config, &app, "web", "BABC"),
            "778743527532.dkr.ecr.us-east-1.amazonaws.com/convox-httpd-hqvvfosgxt:web.BABC"
        );
    }

    #[test]
    fn row_round_trip_keeps_sortable_times() {
        let item = row("BAFVEWUCAYT", "complete", "");
        let build = build_from_item(&item);
        assert_eq!(build.status, BuildStatus::Complete);
        assert_eq!(to_sortable(&build.started), "20170101.120000.000000000");
        assert_eq!(build_to_item(&build)["created"], item["created"]);
    }

    #[tokio::test]
    async fn get_returns_opaque_log_url() {
        let rack = TestRack::new();
        let mut item = row("BAFVEWUCAYT", "complete", "");
        item.insert("logs".into(), "object:///test/foo".into());
        item.insert("ended".into(), "20170101.120500.000000000".into());
        rack.provider
            .substrate()
            .tables
            .put_item("convox-builds", item)
            .await
            .unwrap();

        let build = rack.provider.build_get("httpd", "BAFVEWUCAYT").await.unwrap();
        assert_eq!(build.logs, "object:///test/foo");
        assert_eq!(to_sortable(&build.ended.unwrap()), "20170101.120500.000000000");

        let err = rack.provider.build_get("other", "BAFVEWUCAYT").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn tar_build_runs_to_completion() {
        let rack = TestRack::new();
        rack.seed_app("httpd", "2");

        let opts = BuildCreateOptions {
            description: "first".into(),
            ..Default::default()
        };
        let build = rack
            .provider
            .build_create("httpd", BuildSource::Tar(b"tarball".to_vec()), opts)
            .await
            .unwrap();
        assert_eq!(build.status, BuildStatus::Created);

        let done = settle(&rack, &build.id).await;
        assert_eq!(done.status, BuildStatus::Complete);
        assert_eq!(done.started, build.started);
        assert!(done.ended.is_some());
        assert_eq!(done.logs, format!("object://httpd/builds/{}.log", build.id));
        assert_eq!(rack.provider.build_logs("httpd", &build.id).await.unwrap(), "building\n");

        let spec = rack.cloud.builds.started().pop().unwrap();
        assert_eq!(spec.name, format!("build-{}", build.id));
        assert_eq!(spec.args, ["build", "-"]);
        assert_eq!(spec.stdin.as_deref(), Some(&b"tarball"[..]));
        assert_eq!(spec.env["REGISTRY_USERNAME"], "AWS");
        assert_eq!(spec.env["REGISTRY_ADDRESS"], format!("{ACCOUNT}.dkr.ecr.us-east-1.amazonaws.com"));
        assert_eq!(spec.env["NO_CACHE"], "true");

        let events = rack.cloud.bus.published();
        assert_eq!(events.last().unwrap().subject, "build:create");
    }

    #[tokio::test]
    async fn failing_container_marks_the_build_failed() {
        let rack = TestRack::new();
        rack.seed_app("httpd", "2");
        rack.cloud.builds.set_outcome(BuildOutcome {
            output: b"boom\n".to_vec(),
            exit_code: Some(2),
            delay: Duration::ZERO,
        });

        let build = rack
            .provider
            .build_create("httpd", BuildSource::Url("https://example.org/src.tgz".into()), Default::default())
            .await
            .unwrap();
        let done = settle(&rack, &build.id).await;
        assert_eq!(done.status, BuildStatus::Failed);
        assert_eq!(rack.cloud.builds.started()[0].args[1], "https://example.org/src.tgz");
    }

    #[tokio::test(start_paused = true)]
    async fn hung_container_times_out_and_is_killed() {
        let rack = TestRack::new();
        rack.seed_app("httpd", "2");
        rack.cloud.builds.set_outcome(BuildOutcome {
            exit_code: None,
            ..Default::default()
        });

        let build = rack
            .provider
            .build_create("httpd", BuildSource::Tar(Vec::new()), Default::default())
            .await
            .unwrap();
        tokio::time::sleep(BUILD_TIMEOUT + Duration::from_secs(1)).await;

        let done = settle(&rack, &build.id).await;
        assert_eq!(done.status, BuildStatus::Timeout);
        assert_eq!(rack.cloud.builds.killed(), [format!("build-{}", build.id)]);
    }

    #[tokio::test]
    async fn callback_status_is_not_overridden() {
        let rack = TestRack::new();
        rack.seed_app("httpd", "2");
        rack.cloud.builds.set_outcome(BuildOutcome {
            exit_code: Some(0),
            delay: Duration::from_millis(50),
            ..Default::default()
        });

        let build = rack
            .provider
            .build_create("httpd", BuildSource::Tar(Vec::new()), Default::default())
            .await
            .unwrap();
        rack.provider
            .build_update(
                "httpd",
                &build.id,
                BuildUpdateOptions {
                    status: Some(BuildStatus::Failed),
                    reason: Some("manifest invalid".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let done = settle(&rack, &build.id).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        let done_later = rack.provider.build_get("httpd", &build.id).await.unwrap();
        assert_eq!(done.status, BuildStatus::Failed);
        assert_eq!(done_later.status, BuildStatus::Failed);
        assert_eq!(done_later.reason, "manifest invalid");
    }

    #[tokio::test]
    async fn terminal_builds_can_not_be_reopened() {
        let rack = TestRack::new();
        rack.seed_app("httpd", "2");
        rack.provider
            .substrate()
            .tables
            .put_item("convox-builds", row("BDONE", "complete", ""))
            .await
            .unwrap();

        let err = rack
            .provider
            .build_update(
                "httpd",
                "BDONE",
                BuildUpdateOptions {
                    status: Some(BuildStatus::Running),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Conflict(_)));

        let updated = rack
            .provider
            .build_update(
                "httpd",
                "BDONE",
                BuildUpdateOptions {
                    release: Some("RNEW".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.release, "RNEW");
        assert_eq!(updated.status, BuildStatus::Complete);
    }

    #[tokio::test]
    async fn delete_removes_row_and_images() {
        let rack = TestRack::new();
        rack.seed_app("httpd", "2");
        let manifest = "services:\n  web:\n    build: .\n";
        rack.provider
            .substrate()
            .tables
            .put_item("convox-builds", row("BNOARQMVHUO", "complete", manifest))
            .await
            .unwrap();

        let build = rack.provider.build_delete("httpd", "BNOARQMVHUO").await.unwrap();
        assert_eq!(build.id, "BNOARQMVHUO");
        assert!(rack.provider.build_get("httpd", "BNOARQMVHUO").await.is_err());

        let deletes = rack.cloud.registry.batch_deletes();
        assert_eq!(deletes.len(), 1);
        assert_eq!(deletes[0].0, ACCOUNT);
        assert_eq!(deletes[0].2, ["web.BNOARQMVHUO"]);
    }

    #[tokio::test]
    async fn active_build_is_in_use() {
        let rack = TestRack::new();
        rack.seed_app("httpd", "2");
        let p = &rack.provider;
        p.substrate()
            .tables
            .put_item("convox-builds", row("BACTIVE", "complete", "services:\n  web:\n"))
            .await
            .unwrap();
        let build = p.build_get("httpd", "BACTIVE").await.unwrap();
        let release = p.build_release(&build).await.unwrap();
        p.release_promote("httpd", &release.id).await.unwrap();

        let err = p.build_delete("httpd", "BACTIVE").await.unwrap_err();
        assert!(matches!(err, ProviderError::InUse(_)));
        assert!(p.build_get("httpd", "BACTIVE").await.is_ok());
        assert!(rack.cloud.registry.batch_deletes().is_empty());
    }

    #[tokio::test]
    async fn release_from_build_carries_latest_env() {
        let rack = TestRack::new();
        rack.seed_app("httpd", "2");
        let p = &rack.provider;

        let mut first = Release::new("httpd");
        first.env.set("FOO", "bar");
        p.release_save(&first).await.unwrap();

        let mut build = Build::new("httpd");
        build.manifest = "services:\n  web:\n".into();
        p.build_save(&build).await.unwrap();

        let release = p.build_release(&build).await.unwrap();
        assert_ne!(release.id, first.id);
        assert_eq!(release.build, build.id);
        assert_eq!(p.release_get("httpd", &release.id).await.unwrap().env.get("FOO"), Some("bar"));
        assert_eq!(p.build_get("httpd", &build.id).await.unwrap().release, release.id);
    }

    #[tokio::test]
    async fn list_is_newest_first() {
        let rack = TestRack::new();
        rack.seed_app("httpd", "2");
        for id in ["BA", "BB", "BC"] {
            let mut build = Build::new("httpd");
            build.id = id.to_string();
            rack.provider.build_save(&build).await.unwrap();
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        let ids: Vec<_> = rack
            .provider
            .build_list("httpd", 2)
            .await
            .unwrap()
            .into_iter()
            .map(|b| b.id)
            .collect();
        assert_eq!(ids, ["BC", "BB"]);
    }

    #[tokio::test]
    async fn copy_builds_from_source_images() {
        let rack = TestRack::new();
        rack.seed_app("httpd", "2");
        rack.seed_app("staging", "2");
        let p = &rack.provider;

        let mut build = Build::new("httpd");
        build.manifest = "services:\n  web:\n    build: .\n".into();
        build.status = BuildStatus::Complete;
        p.build_save(&build).await.unwrap();

        let copy = p.build_copy("httpd", &build.id, "staging").await.unwrap();
        assert_eq!(copy.app, "staging");
        assert_eq!(copy.description, format!("Copy of httpd {}", build.id));

        let spec = rack.cloud.builds.started().pop().unwrap();
        assert_eq!(spec.env["APP"], "staging");
        assert_eq!(spec.env["MANIFEST_PATH"], "convox.yml");
    }

    #[tokio::test]
    async fn index_builds_stage_a_directory() {
        let rack = TestRack::new();
        rack.seed_app("httpd", "2");
        let p = &rack.provider;

        let body = b"FROM scratch\n".to_vec();
        let hash = rack_core::content_hash(&body);
        p.index_upload(&hash, body).await.unwrap();
        let index = Index::from([(
            hash,
            rack_core::IndexEntry {
                name: "Dockerfile".into(),
                mode: 0o644,
                mod_time: Utc::now(),
            },
        )]);

        let build = p
            .build_create("httpd", BuildSource::Index(index), Default::default())
            .await
            .unwrap();
        let spec = rack.cloud.builds.started().pop().unwrap();
        assert_ne!(spec.args[1], "-");
        assert!(spec.stdin.is_none());
        assert_eq!(settle(&rack, &build.id).await.status, BuildStatus::Complete);
    }
}
