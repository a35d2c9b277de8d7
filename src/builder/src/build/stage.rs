//! Per-stage build state.
//!
//! A stage moves through
//! `Created → FromAnalyzed → Prepared → Analyzed → Executed → Committed | Reused`.
//! Analysis turns every line into a [`CmdBuilder`] that owns a snapshot of
//! the stage scope taken just before that line.

use std::collections::BTreeMap;
use std::fmt;

use kiln_core::error::{KilnError, Result};

use super::scope::{ArgRegistry, Scope};
use crate::oci::{ContainerInfo, ImageDocument, ImageStore};
use crate::parser::{parse_trigger, resolve_param, Keyword, Line, Page, PlayBook};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageState {
    Created,
    FromAnalyzed,
    Prepared,
    Analyzed,
    Executed,
    Committed,
    Reused,
}

/// What a stage's FROM points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BaseImage {
    Scratch,
    /// Image name or ID in the store
    Image(String),
    /// Index of an earlier stage
    Stage(usize),
}

impl fmt::Display for BaseImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BaseImage::Scratch => f.write_str("scratch"),
            BaseImage::Image(name) => f.write_str(name),
            BaseImage::Stage(idx) => write!(f, "stage {}", idx),
        }
    }
}

/// One instruction, with the scope it executes in.
#[derive(Debug, Clone)]
pub struct CmdBuilder {
    pub line: Line,
    pub scope: Scope,
}

impl CmdBuilder {
    /// Cell values, word-expanded for instructions that expand words.
    pub fn words(&self) -> Result<Vec<String>> {
        if !self.line.command.expands_words() {
            return Ok(self.line.values());
        }
        self.line
            .cells
            .iter()
            .map(|c| self.scope.expand(&c.value, false))
            .collect()
    }

    /// Expanded flag value. `--from` expands strictly.
    pub fn flag(&self, name: &str) -> Result<Option<String>> {
        self.line
            .flag(name)
            .map(|value| self.scope.expand(value, name == "from"))
            .transpose()
    }

    fn context_error(&self, stage: &str, err: KilnError) -> KilnError {
        err.in_instruction(stage, self.line.begin, self.line.command.as_str())
    }
}

/// Runtime state of one stage.
pub struct StageBuilder {
    pub index: usize,
    pub name: String,
    pub page: Page,
    pub state: StageState,
    pub base: BaseImage,
    /// Expanded FROM argument
    pub from_image: String,
    /// Image the working container was created from (`None` for scratch)
    pub base_image_id: Option<String>,
    /// Whether a later stage builds on this stage's image
    pub has_dependents: bool,
    pub scope: Scope,
    pub commands: Vec<CmdBuilder>,
    pub doc: ImageDocument,
    pub container: Option<ContainerInfo>,
    /// Result image (`None` when the stage reduces to scratch)
    pub image_id: Option<String>,
    /// CMD came from the base image and is reset by ENTRYPOINT
    pub cmd_from_base: bool,
}

impl StageBuilder {
    pub fn new(index: usize, page: Page) -> Self {
        Self {
            index,
            name: page.name.clone(),
            has_dependents: page.need_commit,
            page,
            state: StageState::Created,
            base: BaseImage::Scratch,
            from_image: String::new(),
            base_image_id: None,
            scope: Scope::default(),
            commands: Vec::new(),
            doc: ImageDocument::scratch(),
            container: None,
            image_id: None,
            cmd_from_base: false,
        }
    }

    fn transition(&mut self, state: StageState) {
        tracing::debug!(stage = %self.name, from = ?self.state, to = ?state, "Stage transition");
        self.state = state;
    }

    /// Resolve the FROM argument against heading ARGs.
    pub fn analyze_from(&mut self, registry: &ArgRegistry, book: &PlayBook) -> Result<()> {
        let from = self
            .page
            .from_line()
            .ok_or_else(|| KilnError::Semantic(format!("stage {} has no FROM", self.name)))?;
        let raw = from.cells.first().map(|c| c.value.as_str()).unwrap_or_default();
        let image = resolve_param(raw, true, &|name: &str| registry.heading_value(name))
            .map_err(|e| e.in_instruction(&self.name, from.begin, Keyword::From.as_str()))?;

        self.base = if image.eq_ignore_ascii_case("scratch") {
            BaseImage::Scratch
        } else {
            match book.stage_index(&image).filter(|idx| *idx < self.index) {
                Some(idx) => BaseImage::Stage(idx),
                None => BaseImage::Image(image.clone()),
            }
        };
        self.from_image = image;
        self.transition(StageState::FromAnalyzed);
        Ok(())
    }

    /// Create the working container and load the base config.
    ///
    /// ONBUILD triggers of the base image are spliced in right after FROM
    /// and cleared from the new config. Returns the number of triggers.
    pub async fn prepare(
        &mut self,
        store: &dyn ImageStore,
        earlier: &[StageBuilder],
        reserved: &BTreeMap<String, String>,
    ) -> Result<usize> {
        let image_id = match &self.base {
            BaseImage::Scratch => None,
            BaseImage::Image(name) => Some(store.resolve_image(name).await?),
            BaseImage::Stage(idx) => earlier
                .get(*idx)
                .ok_or_else(|| KilnError::Semantic(format!("stage {} is not built yet", idx)))?
                .image_id
                .clone(),
        };

        let mut doc = match &image_id {
            Some(id) => ImageDocument::from_bytes(&store.image_config(id).await?)?,
            None => ImageDocument::scratch(),
        };
        let container = store.create_container(image_id.as_deref()).await?;
        let container_id = container.id.clone();
        self.container = Some(container);

        let (begin, end) = self
            .page
            .from_line()
            .map_or((self.page.begin, self.page.begin), |l| (l.begin, l.end));
        let triggers = std::mem::take(&mut doc.config.on_build);
        let parsed = triggers
            .iter()
            .map(|t| parse_trigger(t, begin, end))
            .collect::<Result<Vec<Line>>>()
            .map_err(|e| e.in_instruction(&self.name, begin, Keyword::Onbuild.as_str()))?;
        let count = parsed.len();
        self.page.lines.splice(1..1, parsed);
        if count > 0 && self.has_dependents {
            self.page.need_commit = true;
        }

        tracing::debug!(
            stage = %self.name,
            base = %self.base,
            image = ?image_id,
            container = %container_id,
            triggers = count,
            "Prepared stage"
        );

        self.cmd_from_base = doc.config.cmd.is_some();
        self.scope = Scope::new(doc.config.env_pairs(), reserved);
        self.doc = doc;
        self.base_image_id = image_id;
        self.transition(StageState::Prepared);
        Ok(count)
    }

    /// Build a [`CmdBuilder`] per instruction, threading ARG and ENV
    /// through the stage scope.
    pub fn analyze(&mut self, registry: &mut ArgRegistry) -> Result<()> {
        let lines: Vec<Line> = self.page.lines.iter().skip(1).cloned().collect();
        let mut commands = Vec::with_capacity(lines.len());
        for line in lines {
            let cmd = CmdBuilder {
                line,
                scope: self.scope.clone(),
            };
            self.apply_scope(&cmd, registry)
                .map_err(|e| cmd.context_error(&self.name, e))?;
            commands.push(cmd);
        }
        self.commands = commands;
        self.transition(StageState::Analyzed);
        Ok(())
    }

    fn apply_scope(&mut self, cmd: &CmdBuilder, registry: &mut ArgRegistry) -> Result<()> {
        match cmd.line.command {
            Keyword::Arg => {
                let Some(key) = cmd.line.cells.first() else {
                    return Ok(());
                };
                let default = cmd
                    .line
                    .cells
                    .get(1)
                    .map(|c| cmd.scope.expand(&c.value, false))
                    .transpose()?;
                self.scope.declare_arg(&key.value, default, registry);
            }
            Keyword::Env => {
                for pair in cmd.words()?.chunks(2) {
                    if let [key, value] = pair {
                        self.scope.set_env(key, value);
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }

    pub fn mark_executed(&mut self) {
        self.transition(StageState::Executed);
    }

    pub fn mark_done(&mut self, state: StageState) {
        self.transition(state);
    }

    pub fn wrap_error(&self, cmd: &CmdBuilder, err: KilnError) -> KilnError {
        cmd.context_error(&self.name, err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_dockerfile;
    use std::collections::HashMap;

    fn stages(dockerfile: &str, args: &[(&str, &str)]) -> (Vec<StageBuilder>, ArgRegistry) {
        let book = parse_dockerfile(dockerfile).unwrap();
        let mut registry = ArgRegistry::new(
            args.iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<HashMap<_, _>>(),
        );
        registry.resolve_heading(&book.heading_args).unwrap();
        let mut stages: Vec<StageBuilder> = book
            .pages
            .iter()
            .enumerate()
            .map(|(i, p)| StageBuilder::new(i, p.clone()))
            .collect();
        for stage in &mut stages {
            stage.analyze_from(&registry, &book).unwrap();
        }
        (stages, registry)
    }

    #[test]
    fn test_analyze_from_kinds() {
        let (stages, _) = stages(
            "FROM alpine AS base\nRUN x\nFROM base\nFROM scratch\nFROM 1\n",
            &[],
        );
        assert_eq!(stages[0].base, BaseImage::Image("alpine".to_string()));
        assert_eq!(stages[1].base, BaseImage::Stage(0));
        assert_eq!(stages[2].base, BaseImage::Scratch);
        assert_eq!(stages[3].base, BaseImage::Stage(1));
        assert!(stages.iter().all(|s| s.state == StageState::FromAnalyzed));
    }

    #[test]
    fn test_analyze_from_heading_args() {
        let (stages, registry) = stages(
            "ARG IMAGE=busybox\nFROM ${IMAGE}:1.36\n",
            &[("IMAGE", "alpine")],
        );
        assert_eq!(stages[0].from_image, "alpine:1.36");
        assert!(registry.unused().is_empty());
    }

    #[test]
    fn test_analyze_from_unresolved_is_error() {
        let book = parse_dockerfile("FROM ${MISSING}\n").unwrap();
        let registry = ArgRegistry::default();
        let mut stage = StageBuilder::new(0, book.pages[0].clone());
        assert!(stage.analyze_from(&registry, &book).is_err());
    }

    #[test]
    fn test_analyze_snapshots_scope() {
        let (mut stages, mut registry) = stages(
            "ARG testArg=0.1\nFROM alpine\nARG testArg\nRUN one\nENV testArg 1.0\nRUN two\n",
            &[],
        );
        let stage = &mut stages[0];
        stage.analyze(&mut registry).unwrap();

        let cmds = &stage.commands;
        assert_eq!(cmds.len(), 4);
        // RUN one sees the ARG
        assert_eq!(cmds[1].scope.arg("testArg").as_deref(), Some("0.1"));
        // RUN two sees only the ENV
        assert!(!cmds[3].scope.has_arg("testArg"));
        assert_eq!(cmds[3].scope.env("testArg"), Some("1.0"));
        assert_eq!(stage.state, StageState::Analyzed);
    }

    #[test]
    fn test_env_pairs_use_previous_values() {
        let (mut stages, mut registry) = stages("FROM alpine\nENV A=1\nENV A=2 B=$A\nRUN x\n", &[]);
        let stage = &mut stages[0];
        stage.analyze(&mut registry).unwrap();
        let run = &stage.commands[2];
        assert_eq!(run.scope.env("A"), Some("2"));
        assert_eq!(run.scope.env("B"), Some("1"));
    }

    #[test]
    fn test_words_expand_only_for_expanding_commands() {
        let (mut stages, mut registry) =
            stages("FROM alpine\nENV DIR=/srv\nWORKDIR $DIR/app\nRUN echo $DIR\n", &[]);
        let stage = &mut stages[0];
        stage.analyze(&mut registry).unwrap();
        assert_eq!(stage.commands[1].words().unwrap(), vec!["/srv/app"]);
        assert_eq!(stage.commands[2].words().unwrap(), vec!["echo $DIR"]);
    }

    #[test]
    fn test_copy_from_flag_is_strict() {
        let (mut stages, mut registry) =
            stages("FROM alpine\nCOPY --from=${SRC} /a /b\nCOPY --chown=${U}:0 a b\n", &[]);
        let stage = &mut stages[0];
        stage.analyze(&mut registry).unwrap();
        assert!(stage.commands[0].flag("from").is_err());
        assert_eq!(stage.commands[1].flag("chown").unwrap().as_deref(), Some(":0"));
        assert_eq!(stage.commands[1].flag("from").unwrap(), None);
    }
}
