//! Build engine.
//!
//! Drives a multi-stage build from Dockerfile text to a tagged image:
//!
//! 1. Parse the Dockerfile into a [`PlayBook`](crate::parser::PlayBook)
//! 2. Resolve heading ARGs and every stage's FROM
//! 3. Build stages in order: prepare, analyze, execute, commit
//! 4. Tag the final image and optionally export it
//!
//! Working containers are removed and the status channel is closed when
//! the build ends, whether it succeeded or not.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use kiln_core::error::{KilnError, Result};
use kiln_core::{BuilderConfig, StatusSender};
use tokio_util::sync::CancellationToken;

use super::commit::commit_stage;
use super::dispatch::{execute, ExecContext};
use super::ignore::IgnoreMatcher;
use super::scope::ArgRegistry;
use super::stage::{BaseImage, StageBuilder, StageState};
use crate::oci::layer::sha256_bytes;
use crate::oci::{check_and_expand_tag, ContainerInfo, Exporter, ImageStore};
use crate::parser::{parse_dockerfile, PlayBook};
use crate::runtime::RuntimeLauncher;

/// Options for one build.
#[derive(Debug, Clone)]
pub struct BuildOptions {
    /// Build context directory
    pub context_dir: PathBuf,
    /// Dockerfile path, relative to the context or absolute
    pub dockerfile: PathBuf,
    /// Tags for the final image
    pub tags: Vec<String>,
    /// `--build-arg` values
    pub build_args: HashMap<String, String>,
    /// Export destination (`transport:path`)
    pub output: Option<String>,
    /// Suppress progress lines
    pub quiet: bool,
}

impl BuildOptions {
    pub fn new(context_dir: impl Into<PathBuf>) -> Self {
        Self {
            context_dir: context_dir.into(),
            dockerfile: PathBuf::from("Dockerfile"),
            tags: Vec::new(),
            build_args: HashMap::new(),
            output: None,
            quiet: false,
        }
    }

    fn dockerfile_path(&self) -> PathBuf {
        if self.dockerfile.is_absolute() {
            self.dockerfile.clone()
        } else {
            self.context_dir.join(&self.dockerfile)
        }
    }
}

/// Step counter for "STEP n/total" progress lines.
struct Progress {
    step: usize,
    total: usize,
}

impl Progress {
    async fn next(&mut self, status: &StatusSender, text: &str) {
        self.step += 1;
        status
            .send(format!("STEP {}/{}: {}", self.step, self.total, text))
            .await;
    }
}

/// One build of one Dockerfile.
pub struct Builder {
    build_id: String,
    options: BuildOptions,
    store: Arc<dyn ImageStore>,
    launcher: Arc<dyn RuntimeLauncher>,
    exporter: Arc<dyn Exporter>,
    config: BuilderConfig,
    status: StatusSender,
    registry: ArgRegistry,
    stages: Vec<StageBuilder>,
    /// Containers mounted for `COPY --from=<image>`
    image_sources: HashMap<String, ContainerInfo>,
}

impl Builder {
    pub fn new(
        options: BuildOptions,
        store: Arc<dyn ImageStore>,
        launcher: Arc<dyn RuntimeLauncher>,
        exporter: Arc<dyn Exporter>,
        config: BuilderConfig,
        status: StatusSender,
    ) -> Self {
        let status = status.quiet(options.quiet);
        Self {
            build_id: uuid::Uuid::new_v4().simple().to_string()[..12].to_string(),
            registry: ArgRegistry::new(options.build_args.clone()),
            options,
            store,
            launcher,
            exporter,
            config,
            status,
            stages: Vec::new(),
            image_sources: HashMap::new(),
        }
    }

    pub fn build_id(&self) -> &str {
        &self.build_id
    }

    /// Run the build and return the final image ID.
    pub async fn build(&mut self, cancel: &CancellationToken) -> Result<String> {
        tracing::info!(
            build = %self.build_id,
            context = %self.options.context_dir.display(),
            "Starting build"
        );

        let result = self.run(cancel).await;
        match &result {
            Ok(image_id) => tracing::info!(build = %self.build_id, image = %image_id, "Build finished"),
            Err(e) => tracing::warn!(build = %self.build_id, error = %e, "Build failed"),
        }

        self.cleanup().await;
        self.status.close().await;
        result
    }

    async fn run(&mut self, cancel: &CancellationToken) -> Result<String> {
        let dockerfile = self.options.dockerfile_path();
        let content = std::fs::read(&dockerfile).map_err(|e| {
            KilnError::Config(format!(
                "failed to read Dockerfile {}: {}",
                dockerfile.display(),
                e
            ))
        })?;
        let digest = sha256_bytes(&content);
        let text = String::from_utf8(content).map_err(|_| {
            KilnError::Config(format!("Dockerfile {} is not UTF-8", dockerfile.display()))
        })?;

        let book = parse_dockerfile(&text)?;
        for warning in &book.warnings {
            self.status.warn(warning.clone()).await;
        }

        let mut tags = Vec::new();
        for tag in &self.options.tags {
            tags.extend(check_and_expand_tag(tag)?);
        }

        let ignore = IgnoreMatcher::load(&self.options.context_dir, Some(&dockerfile))?;
        self.registry.resolve_heading(&book.heading_args)?;
        self.stages = plan_stages(&book, &self.registry)?;

        let mut progress = Progress {
            step: 0,
            total: self.stages.iter().map(|s| s.page.lines.len()).sum(),
        };

        for idx in 0..self.stages.len() {
            if cancel.is_cancelled() {
                return Err(KilnError::Cancelled);
            }
            let (earlier, rest) = self.stages.split_at_mut(idx);
            let stage = &mut rest[0];
            let ctx = ExecContext {
                store: self.store.as_ref(),
                launcher: self.launcher.as_ref(),
                config: &self.config,
                status: &self.status,
                context_dir: &self.options.context_dir,
                ignore: &ignore,
                book: &book,
                earlier,
                cancel,
            };
            build_stage(
                stage,
                &ctx,
                &mut self.registry,
                &mut self.image_sources,
                &digest,
                &mut progress,
            )
            .await?;
        }

        let image_id = self
            .stages
            .last()
            .and_then(|s| s.image_id.clone())
            .ok_or_else(|| KilnError::Semantic("no image was produced".to_string()))?;

        if !tags.is_empty() {
            self.tag(&image_id, &tags).await?;
        }

        if let Some(dest) = &self.options.output {
            self.status
                .send(format!("Exporting {} to {}", short_id(&image_id), dest))
                .await;
            self.exporter.export(&image_id, dest).await?;
        }

        if let Some(warning) = self.registry.unused_warning() {
            self.status.warn(warning).await;
        }
        Ok(image_id)
    }

    /// Add `tags` to the image's existing names.
    async fn tag(&self, image_id: &str, tags: &[String]) -> Result<()> {
        let mut names = self
            .store
            .list_images()
            .await?
            .into_iter()
            .find(|i| i.id == image_id)
            .map(|i| i.names)
            .unwrap_or_default();
        for tag in tags {
            if !names.contains(tag) {
                names.push(tag.clone());
            }
        }
        self.store.set_names(image_id, &names).await?;
        for tag in tags {
            self.status.send(format!("Tagged {}", tag)).await;
        }
        Ok(())
    }

    /// Remove every working container this build created.
    async fn cleanup(&mut self) {
        let mut containers: Vec<ContainerInfo> = self
            .stages
            .iter_mut()
            .filter_map(|s| s.container.take())
            .collect();
        containers.extend(self.image_sources.drain().map(|(_, c)| c));

        for container in containers {
            if let Err(e) = self.store.cleanup_container(&container.id).await {
                tracing::warn!(
                    build = %self.build_id,
                    container = %container.id,
                    error = %e,
                    "Failed to remove working container"
                );
            }
        }
    }
}

/// Create the stages, resolve their FROM and decide which ones are built
/// upon by later stages.
fn plan_stages(book: &PlayBook, registry: &ArgRegistry) -> Result<Vec<StageBuilder>> {
    let mut stages = Vec::with_capacity(book.pages.len());
    for (idx, page) in book.pages.iter().enumerate() {
        let mut stage = StageBuilder::new(idx, page.clone());
        stage.analyze_from(registry, book)?;
        stages.push(stage);
    }

    // FROM arguments built from ARGs only resolve here
    let referenced: Vec<usize> = stages
        .iter()
        .filter_map(|s| match s.base {
            BaseImage::Stage(idx) => Some(idx),
            _ => None,
        })
        .collect();
    let last = stages.len().saturating_sub(1);
    for (idx, stage) in stages.iter_mut().enumerate() {
        if idx == last || referenced.contains(&idx) {
            stage.has_dependents = true;
            if stage.page.lines.len() > 1 {
                stage.page.need_commit = true;
            }
        }
    }
    Ok(stages)
}

async fn build_stage(
    stage: &mut StageBuilder,
    ctx: &ExecContext<'_>,
    registry: &mut ArgRegistry,
    image_sources: &mut HashMap<String, ContainerInfo>,
    digest: &str,
    progress: &mut Progress,
) -> Result<()> {
    let from = stage
        .page
        .from_line()
        .map(|l| l.text())
        .unwrap_or_default();
    progress.next(ctx.status, &from).await;

    let triggers = stage.prepare(ctx.store, ctx.earlier, registry.reserved()).await?;
    if triggers > 0 {
        progress.total += triggers;
        ctx.status
            .send(format!("Executing {} build trigger(s)", triggers))
            .await;
    }
    stage.analyze(registry)?;

    let commands = stage.commands.clone();
    for cmd in &commands {
        if ctx.cancel.is_cancelled() {
            return Err(stage.wrap_error(cmd, KilnError::Cancelled));
        }
        progress.next(ctx.status, &cmd.line.text()).await;
        execute(cmd, stage, ctx, image_sources)
            .await
            .map_err(|e| stage.wrap_error(cmd, e))?;
    }
    stage.mark_executed();

    commit_stage(ctx.store, stage, digest).await?;
    if stage.state == StageState::Committed {
        if let Some(id) = &stage.image_id {
            ctx.status.send(format!("--> {}", short_id(id))).await;
        }
    }
    Ok(())
}

fn short_id(id: &str) -> &str {
    id.get(..12).unwrap_or(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsutil::secure_join;
    use crate::oci::layer::tests::write_test_archive;
    use crate::oci::layer::ArchiveKind;
    use crate::oci::{ImageDocument, LayoutExporter, LocalStore};
    use crate::runtime::RunRequest;
    use async_trait::async_trait;
    use kiln_core::status_channel;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Launcher that understands a few shell commands:
    /// `touch <path>`, `fail` and `wait` (blocks until cancelled).
    #[derive(Default)]
    struct ScriptLauncher {
        requests: Mutex<Vec<RunRequest>>,
    }

    impl ScriptLauncher {
        fn requests(&self) -> Vec<RunRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl RuntimeLauncher for ScriptLauncher {
        async fn run(&self, request: &RunRequest, cancel: &CancellationToken) -> Result<()> {
            self.requests.lock().unwrap().push(request.clone());
            let script = request.args.last().cloned().unwrap_or_default();
            match script.split_whitespace().collect::<Vec<_>>().as_slice() {
                ["touch", path] => {
                    std::fs::write(secure_join(&request.rootfs, path)?, b"")?;
                    Ok(())
                }
                ["fail"] => Err(KilnError::RunFailed {
                    command: request.args.join(" "),
                    code: 1,
                }),
                ["wait"] => {
                    cancel.cancelled().await;
                    Err(KilnError::Cancelled)
                }
                _ => Ok(()),
            }
        }
    }

    struct Env {
        tmp: TempDir,
        store: Arc<LocalStore>,
        launcher: Arc<ScriptLauncher>,
        alpine: String,
    }

    impl Env {
        async fn new() -> Self {
            let tmp = TempDir::new().unwrap();
            let store = Arc::new(
                LocalStore::new(&tmp.path().join("images"), &tmp.path().join("containers"))
                    .unwrap(),
            );
            let archive = tmp.path().join("alpine.tar");
            write_test_archive(&archive, ArchiveKind::Tar, &[("etc/os-release", b"ID=alpine\n")]);
            let alpine = store.import_rootfs(&archive, "alpine").await.unwrap();
            std::fs::create_dir_all(tmp.path().join("context")).unwrap();
            Self {
                tmp,
                store,
                launcher: Arc::new(ScriptLauncher::default()),
                alpine,
            }
        }

        fn options(&self, dockerfile: &str) -> BuildOptions {
            let context = self.tmp.path().join("context");
            std::fs::write(context.join("Dockerfile"), dockerfile).unwrap();
            BuildOptions::new(context)
        }

        async fn build(&self, options: BuildOptions) -> (Result<String>, Vec<String>) {
            self.build_with(options, &CancellationToken::new()).await
        }

        async fn build_with(
            &self,
            options: BuildOptions,
            cancel: &CancellationToken,
        ) -> (Result<String>, Vec<String>) {
            let (status, receiver) = status_channel(256);
            let mut builder = Builder::new(
                options,
                self.store.clone(),
                self.launcher.clone(),
                Arc::new(LayoutExporter::new(self.store.clone())),
                BuilderConfig::default(),
                status,
            );
            let result = builder.build(cancel).await;
            (result, receiver.collect().await)
        }

        fn leftover_containers(&self) -> usize {
            std::fs::read_dir(self.tmp.path().join("containers"))
                .unwrap()
                .count()
        }

        async fn doc(&self, image_id: &str) -> ImageDocument {
            ImageDocument::from_bytes(&self.store.image_config(image_id).await.unwrap()).unwrap()
        }
    }

    #[tokio::test]
    async fn test_two_stage_copy_from() {
        let env = Env::new().await;
        let options =
            env.options("FROM alpine AS a\nRUN touch /f\nFROM alpine\nCOPY --from=a /f /f\n");
        let (result, status) = env.build(options).await;
        let image_id = result.unwrap();

        assert_ne!(image_id, env.alpine);
        let rootfs = env.store.image_rootfs(&image_id).await.unwrap();
        assert!(rootfs.join("f").is_file());
        assert!(rootfs.join("etc/os-release").is_file());

        assert_eq!(status[0], "STEP 1/4: FROM alpine AS a");
        assert!(status.contains(&"STEP 4/4: COPY --from=a /f /f".to_string()));
        assert_eq!(env.launcher.requests().len(), 1);
        assert_eq!(env.leftover_containers(), 0);
    }

    #[tokio::test]
    async fn test_arg_scope_and_unused_warning() {
        let env = Env::new().await;
        let mut options = env.options(
            "ARG testArg=0.1\nFROM alpine\nARG testArg\nRUN echo\nENV testArg 1.0\nRUN echo\n",
        );
        options.build_args = [("HTTPS_PROXY", "127.0.0.1"), ("other", "x")]
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let (result, status) = env.build(options).await;
        let image_id = result.unwrap();

        let requests = env.launcher.requests();
        assert!(requests[0].env.contains(&"testArg=0.1".to_string()));
        assert!(requests[0].env.contains(&"HTTPS_PROXY=127.0.0.1".to_string()));
        assert!(requests[1].env.contains(&"testArg=1.0".to_string()));
        assert!(!requests[1].env.contains(&"testArg=0.1".to_string()));

        assert_eq!(
            status.last().map(String::as_str),
            Some("[Warning] One or more build-args [other] were not consumed")
        );
        let doc = env.doc(&image_id).await;
        assert!(doc.config.env.contains(&"testArg=1.0".to_string()));
    }

    #[tokio::test]
    async fn test_tags_are_added() {
        let env = Env::new().await;
        let mut options = env.options("FROM alpine\nLABEL version=1\n");
        options.tags = vec!["kiln/app".to_string()];
        let (result, status) = env.build(options).await;
        let image_id = result.unwrap();

        assert_eq!(env.store.resolve_image("kiln/app:latest").await.unwrap(), image_id);
        assert!(status.iter().any(|l| l == "Tagged kiln/app:latest"));
        assert_eq!(env.doc(&image_id).await.config.labels["version"], "1");
    }

    #[tokio::test]
    async fn test_from_only_reuses_base_and_keeps_names() {
        let env = Env::new().await;
        let mut options = env.options("FROM alpine\n");
        options.tags = vec!["mirror".to_string()];
        let (result, _) = env.build(options).await;

        assert_eq!(result.unwrap(), env.alpine);
        assert_eq!(env.store.resolve_image("alpine").await.unwrap(), env.alpine);
        assert_eq!(env.store.resolve_image("mirror").await.unwrap(), env.alpine);
    }

    #[tokio::test]
    async fn test_invalid_tag_fails_before_building() {
        let env = Env::new().await;
        let mut options = env.options("FROM alpine\nRUN echo\n");
        options.tags = vec!["a:b:c".to_string()];
        let (result, _) = env.build(options).await;

        assert!(matches!(result, Err(KilnError::InvalidTag(_))));
        assert!(env.launcher.requests().is_empty());
    }

    #[tokio::test]
    async fn test_run_failure_cleans_up() {
        let env = Env::new().await;
        let options = env.options("FROM alpine\nRUN fail\nRUN echo\n");
        let (result, status) = env.build(options).await;

        let err = result.unwrap_err();
        assert!(matches!(err.root_cause(), KilnError::RunFailed { code: 1, .. }));
        assert!(err.to_string().contains("RUN"));
        assert_eq!(env.launcher.requests().len(), 1);
        assert!(!status.iter().any(|l| l.contains("RUN echo")));
        assert_eq!(env.leftover_containers(), 0);
    }

    #[tokio::test]
    async fn test_cancel_during_run() {
        let env = Env::new().await;
        let options = env.options("FROM alpine\nRUN wait\nRUN echo\n");
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            token.cancel();
        });

        let (result, _) = env.build_with(options, &cancel).await;
        assert!(matches!(result.unwrap_err().root_cause(), KilnError::Cancelled));
        assert_eq!(env.launcher.requests().len(), 1);
        assert_eq!(env.leftover_containers(), 0);
    }

    #[tokio::test]
    async fn test_scratch_without_instructions_produces_nothing() {
        let env = Env::new().await;
        let (result, _) = env.build(env.options("FROM scratch\n")).await;
        assert!(matches!(result, Err(KilnError::Semantic(_))));
    }

    #[tokio::test]
    async fn test_missing_dockerfile() {
        let env = Env::new().await;
        let options = BuildOptions::new(env.tmp.path().join("nowhere"));
        let (result, status) = env.build(options).await;
        assert!(matches!(result, Err(KilnError::Config(_))));
        assert!(status.is_empty());
    }

    #[tokio::test]
    async fn test_onbuild_triggers_run_in_child() {
        let env = Env::new().await;
        let mut options = env.options("FROM alpine\nONBUILD RUN touch /triggered\n");
        options.tags = vec!["base-onbuild".to_string()];
        let (result, _) = env.build(options).await;
        let parent = result.unwrap();
        assert_eq!(env.doc(&parent).await.config.on_build, vec!["RUN touch /triggered"]);
        assert!(env.launcher.requests().is_empty());

        let (result, status) = env.build(env.options("FROM base-onbuild\nLABEL x=y\n")).await;
        let child = result.unwrap();
        assert_eq!(env.launcher.requests().len(), 1);
        assert!(env.store.image_rootfs(&child).await.unwrap().join("triggered").exists());
        assert!(env.doc(&child).await.config.on_build.is_empty());
        assert!(status.contains(&"STEP 3/3: LABEL x=y".to_string()));
    }

    #[tokio::test]
    async fn test_stage_from_stage_by_arg() {
        let env = Env::new().await;
        let options = env.options(
            "ARG BASE=builder\nFROM alpine AS builder\nRUN touch /built\nFROM ${BASE}\nLABEL a=b\n",
        );
        let (result, _) = env.build(options).await;
        let image_id = result.unwrap();
        let rootfs = env.store.image_rootfs(&image_id).await.unwrap();
        assert!(rootfs.join("built").exists());
    }

    #[tokio::test]
    async fn test_export_layout() {
        let env = Env::new().await;
        let out = env.tmp.path().join("layout");
        let mut options = env.options("FROM alpine\nLABEL a=b\n");
        options.output = Some(format!("oci:{}", out.display()));
        let (result, _) = env.build(options).await;
        result.unwrap();
        assert!(out.join("oci-layout").is_file());
        assert!(out.join("index.json").is_file());
    }

    #[tokio::test]
    async fn test_quiet_keeps_warnings() {
        let env = Env::new().await;
        let mut options = env.options("FROM alpine\nMAINTAINER someone\n");
        options.quiet = true;
        options.build_args.insert("unused".to_string(), "1".to_string());
        let (result, status) = env.build(options).await;
        result.unwrap();
        assert_eq!(status.len(), 2);
        assert!(status.iter().all(|l| !l.starts_with("STEP")));
    }
}
