//! Instruction execution.
//!
//! [`execute`] matches on the instruction keyword and applies it to the
//! stage: most instructions only edit the image config, RUN goes to the
//! runtime launcher and ADD/COPY touch the stage root filesystem.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use chrono::Utc;
use kiln_core::error::{KilnError, Result};
use kiln_core::{BuilderConfig, StatusSender};
use tokio_util::sync::CancellationToken;

use super::copy::{copy_sources, CopyRequest};
use super::ignore::IgnoreMatcher;
use super::signal::parse_signal;
use super::stage::{CmdBuilder, StageBuilder};
use super::user::resolve_user;
use crate::fsutil::{clean_path, secure_join};
use crate::oci::{ContainerInfo, EmptyObject, HealthConfig, History, ImageStore};
use crate::parser::{parse_duration, Keyword, PlayBook};
use crate::runtime::{RunRequest, RuntimeLauncher};

const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_HEALTH_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_HEALTH_START_PERIOD: Duration = Duration::ZERO;
const DEFAULT_HEALTH_RETRIES: i64 = 3;

/// Everything an instruction may need besides its own stage.
pub struct ExecContext<'a> {
    pub store: &'a dyn ImageStore,
    pub launcher: &'a dyn RuntimeLauncher,
    pub config: &'a BuilderConfig,
    pub status: &'a StatusSender,
    pub context_dir: &'a Path,
    pub ignore: &'a IgnoreMatcher,
    pub book: &'a PlayBook,
    /// Stages built before the current one
    pub earlier: &'a [StageBuilder],
    pub cancel: &'a CancellationToken,
}

/// Execute one instruction against its stage.
///
/// `image_sources` caches containers mounted for `COPY --from=<image>`;
/// the engine removes them when the build ends.
pub async fn execute(
    cmd: &CmdBuilder,
    stage: &mut StageBuilder,
    ctx: &ExecContext<'_>,
    image_sources: &mut HashMap<String, ContainerInfo>,
) -> Result<()> {
    let line = &cmd.line;
    match line.command {
        Keyword::Add | Keyword::Copy => copy(cmd, stage, ctx, image_sources).await?,
        Keyword::Arg => {}
        Keyword::Cmd => {
            stage.doc.config.cmd = Some(command_argv(cmd, stage, ctx.config));
            stage.cmd_from_base = false;
        }
        Keyword::Entrypoint => {
            stage.doc.config.entrypoint = Some(command_argv(cmd, stage, ctx.config));
            if stage.cmd_from_base {
                stage.doc.config.cmd = None;
                stage.cmd_from_base = false;
            }
        }
        Keyword::Env => {
            for pair in cmd.words()?.chunks(2) {
                if let [key, value] = pair {
                    stage.doc.config.set_env(key, value);
                }
            }
        }
        Keyword::Expose => {
            for word in cmd.words()? {
                for port in parse_ports(&word)? {
                    stage.doc.config.exposed_ports.insert(port, EmptyObject {});
                }
            }
        }
        Keyword::From => {
            return Err(KilnError::Semantic(
                "FROM cannot be executed inside a stage".to_string(),
            ))
        }
        Keyword::Healthcheck => stage.doc.config.healthcheck = Some(healthcheck(cmd)?),
        Keyword::Label => {
            for pair in cmd.words()?.chunks(2) {
                if let [key, value] = pair {
                    stage.doc.config.labels.insert(key.clone(), value.clone());
                }
            }
        }
        Keyword::Maintainer => stage.doc.author = first_word(cmd)?,
        Keyword::Onbuild => {
            let trigger = line.cells.first().map(|c| c.value.clone()).unwrap_or_default();
            stage.doc.config.on_build.push(trigger);
        }
        Keyword::Run => run(cmd, stage, ctx).await?,
        Keyword::Shell => stage.doc.config.shell = Some(line.values()),
        Keyword::Stopsignal => {
            let signal = first_word(cmd)?;
            parse_signal(&signal)?;
            stage.doc.config.stop_signal = signal;
        }
        Keyword::User => stage.doc.config.user = first_word(cmd)?,
        Keyword::Volume => {
            let mountpoint = mountpoint(stage)?.to_path_buf();
            for volume in cmd.words()? {
                if volume.trim().is_empty() {
                    return Err(KilnError::Semantic("VOLUME path cannot be empty".to_string()));
                }
                std::fs::create_dir_all(secure_join(&mountpoint, &volume)?)?;
                stage.doc.config.volumes.insert(volume, EmptyObject {});
            }
        }
        Keyword::Workdir => workdir(cmd, stage)?,
    }

    stage.doc.history.push(History {
        created: Some(Utc::now()),
        created_by: line.text(),
        empty_layer: !matches!(line.command, Keyword::Run | Keyword::Add | Keyword::Copy),
    });
    Ok(())
}

fn first_word(cmd: &CmdBuilder) -> Result<String> {
    cmd.words()?.into_iter().next().ok_or_else(|| {
        KilnError::Semantic(format!("{} requires an argument", cmd.line.command))
    })
}

fn mountpoint(stage: &StageBuilder) -> Result<&Path> {
    stage
        .container
        .as_ref()
        .map(|c| c.mountpoint.as_path())
        .ok_or_else(|| KilnError::Semantic(format!("stage {} has no container", stage.name)))
}

/// Argv for CMD/ENTRYPOINT/RUN: JSON form as written, shell form wrapped
/// in the stage's current SHELL.
fn command_argv(cmd: &CmdBuilder, stage: &StageBuilder, config: &BuilderConfig) -> Vec<String> {
    if cmd.line.is_json() {
        return cmd.line.values();
    }
    let mut argv = stage
        .doc
        .config
        .shell
        .clone()
        .unwrap_or_else(|| config.default_shell.clone());
    argv.extend(cmd.line.values());
    argv
}

/// `80`, `80/udp`, `8000-8002/tcp` → `port/proto` entries.
fn parse_ports(word: &str) -> Result<Vec<String>> {
    let invalid = |why: &str| KilnError::Semantic(format!("invalid EXPOSE {:?}: {}", word, why));

    let (ports, proto) = word.split_once('/').unwrap_or((word, "tcp"));
    let proto = proto.to_ascii_lowercase();
    if !matches!(proto.as_str(), "tcp" | "udp" | "sctp") {
        return Err(invalid("protocol must be tcp, udp or sctp"));
    }

    let parse = |p: &str| -> Result<u16> {
        p.parse::<u16>()
            .ok()
            .filter(|p| *p > 0)
            .ok_or_else(|| invalid("port must be between 1 and 65535"))
    };
    let (start, end) = match ports.split_once('-') {
        Some((start, end)) => (parse(start)?, parse(end)?),
        None => {
            let port = parse(ports)?;
            (port, port)
        }
    };
    if start > end {
        return Err(invalid("range start is above range end"));
    }
    Ok((start..=end).map(|p| format!("{}/{}", p, proto)).collect())
}

fn health_duration(cmd: &CmdBuilder, flag: &str, default: Duration) -> Result<i64> {
    let duration = match cmd.line.flag(flag) {
        Some(value) => parse_duration(value)
            .map_err(|e| KilnError::Semantic(format!("invalid --{}: {}", flag, e)))?,
        None => Duration::ZERO,
    };
    let duration = if duration.is_zero() { default } else { duration };
    i64::try_from(duration.as_nanos())
        .map_err(|_| KilnError::Semantic(format!("--{} is too large", flag)))
}

fn healthcheck(cmd: &CmdBuilder) -> Result<HealthConfig> {
    let line = &cmd.line;
    if !line.is_json() && line.cells.first().is_some_and(|c| c.value == "NONE") {
        return Ok(HealthConfig {
            test: vec!["NONE".to_string()],
            ..HealthConfig::default()
        });
    }

    let test = if line.is_json() {
        std::iter::once("CMD".to_string()).chain(line.values()).collect()
    } else {
        std::iter::once("CMD-SHELL".to_string()).chain(line.values()).collect()
    };
    let retries = match line.flag("retries") {
        Some(value) => value
            .parse::<i64>()
            .ok()
            .filter(|r| *r >= 1)
            .ok_or_else(|| KilnError::Semantic(format!("invalid --retries {:?}", value)))?,
        None => DEFAULT_HEALTH_RETRIES,
    };

    Ok(HealthConfig {
        test,
        interval: health_duration(cmd, "interval", DEFAULT_HEALTH_INTERVAL)?,
        timeout: health_duration(cmd, "timeout", DEFAULT_HEALTH_TIMEOUT)?,
        start_period: health_duration(cmd, "start-period", DEFAULT_HEALTH_START_PERIOD)?,
        retries,
    })
}

fn workdir(cmd: &CmdBuilder, stage: &mut StageBuilder) -> Result<()> {
    let word = first_word(cmd)?;
    let current = if stage.doc.config.working_dir.is_empty() {
        "/"
    } else {
        stage.doc.config.working_dir.as_str()
    };
    let path = if word.starts_with('/') {
        clean_path(&word)
    } else {
        clean_path(&format!("{}/{}", current, word))
    };

    let host_path = secure_join(mountpoint(stage)?, &path)?;
    std::fs::create_dir_all(&host_path).map_err(|e| {
        KilnError::Io(std::io::Error::new(
            e.kind(),
            format!("failed to create WORKDIR {}: {}", path, e),
        ))
    })?;
    stage.doc.config.working_dir = path;
    Ok(())
}

async fn run(cmd: &CmdBuilder, stage: &StageBuilder, ctx: &ExecContext<'_>) -> Result<()> {
    let container = stage
        .container
        .as_ref()
        .ok_or_else(|| KilnError::Semantic(format!("stage {} has no container", stage.name)))?;
    let config = &stage.doc.config;

    let mut env = config.env.clone();
    env.extend(cmd.scope.run_args(&config.env_pairs()));
    let (uid, gid) = resolve_user(&container.mountpoint, &config.user)?;

    let request = RunRequest {
        container_id: container.id.clone(),
        rootfs: container.mountpoint.clone(),
        args: command_argv(cmd, stage, ctx.config),
        env,
        cwd: if config.working_dir.is_empty() {
            "/".to_string()
        } else {
            config.working_dir.clone()
        },
        uid,
        gid,
        capabilities: ctx.config.capabilities.clone(),
    };
    ctx.launcher.run(&request, ctx.cancel).await
}

async fn copy(
    cmd: &CmdBuilder,
    stage: &StageBuilder,
    ctx: &ExecContext<'_>,
    image_sources: &mut HashMap<String, ContainerInfo>,
) -> Result<()> {
    let words = cmd.words()?;
    let Some((dest, sources)) = words.split_last() else {
        return Err(KilnError::Semantic(format!(
            "{} requires a source and a destination",
            cmd.line.command
        )));
    };
    let dest_root = mountpoint(stage)?;

    let chown = match cmd.flag("chown")? {
        Some(spec) => Some(resolve_user(dest_root, &spec)?),
        None => None,
    };

    let from = cmd.flag("from")?;
    let source_root = match &from {
        None => ctx.context_dir.to_path_buf(),
        Some(name) => match ctx.book.stage_index(name) {
            Some(idx) => {
                let source = ctx.earlier.get(idx).ok_or_else(|| {
                    KilnError::Semantic(format!(
                        "--from={} refers to stage {} which is not built before stage {}",
                        name, idx, stage.name
                    ))
                })?;
                mountpoint(source)?.to_path_buf()
            }
            None => image_source(name, ctx, image_sources).await?,
        },
    };

    let workdir = if stage.doc.config.working_dir.is_empty() {
        "/"
    } else {
        stage.doc.config.working_dir.as_str()
    };
    copy_sources(&CopyRequest {
        sources,
        dest,
        source_root: &source_root,
        ignore: from.is_none().then_some(ctx.ignore),
        mountpoint: dest_root,
        workdir,
        chown,
        extract_archives: cmd.line.command == Keyword::Add && from.is_none(),
    })
}

/// Mountpoint of an image named by `--from`, mounting it on first use.
async fn image_source(
    name: &str,
    ctx: &ExecContext<'_>,
    image_sources: &mut HashMap<String, ContainerInfo>,
) -> Result<std::path::PathBuf> {
    if let Some(container) = image_sources.get(name) {
        return Ok(container.mountpoint.clone());
    }
    let image_id = ctx.store.resolve_image(name).await?;
    let container = ctx.store.create_container(Some(&image_id)).await?;
    ctx.status
        .send(format!("Mounted {} for COPY --from", name))
        .await;
    let mountpoint = container.mountpoint.clone();
    image_sources.insert(name.to_string(), container);
    Ok(mountpoint)
}
