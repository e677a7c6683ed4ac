use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use banana_contracts::events::{EventWriter, EVENTS_FILE};
use banana_contracts::history::manifest::{SessionManifest, IMAGES_DIR};
use banana_contracts::history::{EntryId, HistoryStore};
use banana_contracts::image::{Image, Mask, DEFAULT_MASK_THRESHOLD};
use banana_contracts::presets::PromptPresets;
use banana_contracts::resolution::ResolutionTier;
use banana_engine::{
    Action, Credentials, EngineConfig, GenerationClient, Orchestrator, RenderKind,
};
use clap::{Args, Parser, Subcommand, ValueEnum};

#[derive(Debug, Parser)]
#[command(name = "banana-rs", version, about = "Render and edit images with a hosted image model")]
struct Cli {
    /// Engine config file (JSON). Missing files mean defaults.
    #[arg(long, global = true, default_value = "banana.json")]
    config: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Turn a depth pass or colour render into a finished image.
    Render(RenderArgs),
    /// Inpaint, integrate an object, or edit the whole image.
    Edit(EditArgs),
    /// Print the version tree of a session.
    History(HistoryArgs),
    /// Make an earlier version current.
    Restore(RestoreArgs),
    /// Manage named prompts stored in the config file.
    Presets {
        #[command(subcommand)]
        action: PresetCommand,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum RenderKindArg {
    Depth,
    Regular,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum EditMode {
    Inpaint,
    Integrate,
    FullEdit,
}

#[derive(Debug, Args)]
struct PromptArgs {
    #[arg(long)]
    prompt: Option<String>,
    /// Preset whose text is used as (or put before) the prompt.
    #[arg(long)]
    preset: Option<String>,
    #[arg(long, default_value = "AUTO")]
    resolution: ResolutionTier,
    /// Also write the resulting image here.
    #[arg(long)]
    out: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct RenderArgs {
    #[arg(long)]
    session: PathBuf,
    #[arg(long)]
    input: PathBuf,
    #[arg(long, value_enum, default_value = "depth")]
    kind: RenderKindArg,
    /// Style reference image.
    #[arg(long)]
    reference: Option<PathBuf>,
    #[command(flatten)]
    prompt: PromptArgs,
}

#[derive(Debug, Args)]
struct EditArgs {
    #[arg(long)]
    session: PathBuf,
    #[arg(long, value_enum)]
    mode: EditMode,
    /// Painted mask; any channel above the threshold is editable.
    #[arg(long)]
    mask: Option<PathBuf>,
    #[arg(long, default_value_t = DEFAULT_MASK_THRESHOLD)]
    mask_threshold: u8,
    #[arg(long)]
    reference: Option<PathBuf>,
    /// Edit this file instead of the current version.
    #[arg(long, conflicts_with = "from")]
    base: Option<PathBuf>,
    /// Branch from this version (e.g. v2) instead of the current one.
    #[arg(long)]
    from: Option<String>,
    #[command(flatten)]
    prompt: PromptArgs,
}

#[derive(Debug, Args)]
struct HistoryArgs {
    #[arg(long)]
    session: PathBuf,
    /// Print the raw session file.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct RestoreArgs {
    #[arg(long)]
    session: PathBuf,
    #[arg(long)]
    version: String,
    #[arg(long)]
    out: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
enum PresetCommand {
    List,
    Add {
        name: String,
        prompt: String,
    },
    Update {
        name: String,
        #[arg(long)]
        rename: Option<String>,
        #[arg(long)]
        prompt: Option<String>,
    },
    Delete {
        name: String,
    },
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("banana-rs error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Render(args) => with_runtime(run_render(&cli.config, args)),
        Command::Edit(args) => with_runtime(run_edit(&cli.config, args)),
        Command::History(args) => run_history(args),
        Command::Restore(args) => run_restore(&cli.config, args),
        Command::Presets { action } => run_presets(&cli.config, action),
    }
}

fn with_runtime(task: impl std::future::Future<Output = Result<i32>>) -> Result<i32> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;
    runtime.block_on(task)
}

async fn run_render(config_path: &Path, args: RenderArgs) -> Result<i32> {
    let config = EngineConfig::resolve(Some(config_path))?;
    let prompt = compose_prompt(&config.presets, &args.prompt)?;
    let base = Image::load(&args.input)?;
    let kind = match args.kind {
        RenderKindArg::Depth => RenderKind::Depth,
        RenderKindArg::Regular => RenderKind::Regular,
    };
    let mut action =
        Action::render(kind, base, prompt).with_resolution(args.prompt.resolution);
    if let Some(reference) = args.reference.as_ref() {
        action = action.with_reference(Image::load(reference)?);
    }

    let orchestrator = open_session(&config, &args.session)?;
    perform(&orchestrator, action, &args.session, args.prompt.out.as_deref()).await
}

async fn run_edit(config_path: &Path, args: EditArgs) -> Result<i32> {
    let config = EngineConfig::resolve(Some(config_path))?;
    let prompt = compose_prompt(&config.presets, &args.prompt)?;
    let orchestrator = open_session(&config, &args.session)?;

    if let Some(label) = args.from.as_deref() {
        let id = find_version(&orchestrator, label)?;
        orchestrator.restore(id)?;
    }

    let mask = args
        .mask
        .as_ref()
        .map(|path| Mask::load(path, args.mask_threshold))
        .transpose()?;
    let reference = args.reference.as_ref().map(Image::load).transpose()?;

    let mut action = match (args.mode, mask) {
        (EditMode::FullEdit, None) => Action::full_edit(prompt),
        (EditMode::FullEdit, Some(_)) => bail!("full-edit takes no mask; use --mode inpaint"),
        (EditMode::Inpaint, Some(mask)) => Action::inpaint(mask, prompt),
        (EditMode::Integrate, Some(mask)) => {
            let Some(object) = reference.clone() else {
                bail!("integrate needs --reference with the object to place");
            };
            Action::integrate(mask, object, prompt)
        }
        (_, None) => bail!("--mask is required for inpaint and integrate"),
    };
    if args.mode != EditMode::Integrate {
        if let Some(reference) = reference {
            action = action.with_reference(reference);
        }
    }
    if let Some(base) = args.base.as_ref() {
        action = action.with_base(Image::load(base)?);
    }
    action = action.with_resolution(args.prompt.resolution);

    perform(&orchestrator, action, &args.session, args.prompt.out.as_deref()).await
}

fn run_history(args: HistoryArgs) -> Result<i32> {
    if !SessionManifest::exists_in(&args.session) {
        bail!("no session found in {}", args.session.display());
    }
    if args.json {
        let manifest = SessionManifest::read(&args.session)?;
        println!("{}", serde_json::to_string_pretty(&manifest)?);
        return Ok(0);
    }
    let (_, history) = SessionManifest::load(&args.session)?;
    for line in history_lines(&history) {
        println!("{line}");
    }
    Ok(0)
}

fn run_restore(config_path: &Path, args: RestoreArgs) -> Result<i32> {
    let config = EngineConfig::resolve(Some(config_path))?;
    let orchestrator = open_session(&config, &args.session)?;
    let id = find_version(&orchestrator, &args.version)?;
    orchestrator.restore(id)?;
    orchestrator.save_session(&args.session)?;
    if let Some(out) = args.out.as_ref() {
        if let Some((_, image)) = orchestrator.current() {
            image.save_png(out)?;
        }
    }
    println!("current version: {}", id.version_label());
    Ok(0)
}

fn run_presets(config_path: &Path, action: PresetCommand) -> Result<i32> {
    let mut config = EngineConfig::load_or_default(config_path)?;
    match action {
        PresetCommand::List => {
            if config.presets.is_empty() {
                println!("no presets");
            }
            for (name, prompt) in config.presets.iter() {
                println!("{name}: {prompt}");
            }
            return Ok(0);
        }
        PresetCommand::Add { name, prompt } => {
            config.presets.add(&name, &prompt)?;
            println!("added preset '{}'", name.trim());
        }
        PresetCommand::Update {
            name,
            rename,
            prompt,
        } => {
            if rename.is_none() && prompt.is_none() {
                bail!("nothing to update; pass --rename and/or --prompt");
            }
            config
                .presets
                .update(&name, rename.as_deref(), prompt.as_deref())?;
            println!("updated preset '{name}'");
        }
        PresetCommand::Delete { name } => {
            config.presets.delete(&name)?;
            println!("deleted preset '{name}'");
        }
    }
    config.save(config_path)?;
    Ok(0)
}

fn open_session(config: &EngineConfig, dir: &Path) -> Result<Orchestrator> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create {}", dir.display()))?;
    let history = if SessionManifest::exists_in(dir) {
        SessionManifest::load(dir)?.1
    } else {
        HistoryStore::new()
    };
    let events = EventWriter::new(dir.join(EVENTS_FILE), history.store_id().to_string());
    let client = GenerationClient::from_config(config)?;
    let credentials = Credentials::from_env(config.provider);
    Ok(Orchestrator::with_history(
        client,
        credentials,
        events,
        history,
    ))
}

async fn perform(
    orchestrator: &Orchestrator,
    action: Action,
    session: &Path,
    out: Option<&Path>,
) -> Result<i32> {
    let mode = action.mode();
    let pending = orchestrator.perform_action(action);
    tokio::pin!(pending);
    let outcome = tokio::select! {
        outcome = &mut pending => outcome,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("cancelling {mode}...");
            orchestrator.cancel();
            pending.await
        }
    };

    let id = match outcome {
        Ok(id) => id,
        Err(err) if err.is_cancelled() => {
            eprintln!("{mode} cancelled");
            return Ok(130);
        }
        Err(err) => return Err(err.into()),
    };

    let manifest = orchestrator.save_session(session)?;
    if let Some(out) = out {
        if let Some((_, image)) = orchestrator.current() {
            image.save_png(out)?;
        }
    }
    let file = manifest
        .versions
        .iter()
        .find(|record| record.version_id == id.version_label())
        .map(|record| record.image.clone())
        .unwrap_or_default();
    println!(
        "{} {mode} -> {}",
        id.version_label(),
        session.join(IMAGES_DIR).join(file).display()
    );
    Ok(0)
}

fn compose_prompt(presets: &PromptPresets, args: &PromptArgs) -> Result<String> {
    let preset = match args.preset.as_deref() {
        Some(name) => Some(
            presets
                .get(name)
                .with_context(|| format!("unknown preset '{name}'"))?,
        ),
        None => None,
    };
    let prompt = match (preset, args.prompt.as_deref()) {
        (Some(preset), Some(extra)) => format!("{preset}\n{extra}"),
        (Some(preset), None) => preset.to_string(),
        (None, Some(prompt)) => prompt.to_string(),
        (None, None) => bail!("pass --prompt or --preset"),
    };
    Ok(prompt)
}

fn find_version(orchestrator: &Orchestrator, label: &str) -> Result<EntryId> {
    orchestrator
        .history(|history| history.find_version(label))
        .with_context(|| format!("no version '{label}' in this session"))
}

fn history_lines(history: &HistoryStore) -> Vec<String> {
    let current = history.current_id();
    history
        .iter()
        .map(|entry| {
            let request = entry.result().request();
            let (width, height) = request.target();
            let marker = if Some(entry.id()) == current { "*" } else { " " };
            let parent = entry
                .parent()
                .map(|parent| format!(" <- {}", parent.version_label()))
                .unwrap_or_default();
            let prompt: String = request
                .prompt()
                .lines()
                .next()
                .unwrap_or_default()
                .chars()
                .take(60)
                .collect();
            format!(
                "{marker} {}{parent} [{}] {} {width}x{height} {}",
                entry.id().version_label(),
                request.mode(),
                request.target_resolution(),
                prompt,
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use banana_contracts::history::GenerationResult;
    use banana_contracts::request::{GenerationMode, RequestBuilder};
    use clap::CommandFactory;
    use image::{DynamicImage, Rgb, RgbImage};

    use super::*;

    fn solid(shade: u8) -> Image {
        Image::from_dynamic(DynamicImage::ImageRgb8(RgbImage::from_pixel(
            4,
            4,
            Rgb([shade, shade, shade]),
        )))
    }

    fn prompt_args(prompt: Option<&str>, preset: Option<&str>) -> PromptArgs {
        PromptArgs {
            prompt: prompt.map(str::to_string),
            preset: preset.map(str::to_string),
            resolution: ResolutionTier::Auto,
            out: None,
        }
    }

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn edit_arguments_parse() -> anyhow::Result<()> {
        let cli = Cli::try_parse_from([
            "banana-rs",
            "edit",
            "--session",
            "s",
            "--mode",
            "full-edit",
            "--prompt",
            "dusk",
            "--resolution",
            "2k",
            "--from",
            "v1",
        ])?;
        let Command::Edit(args) = cli.command else {
            panic!("expected edit");
        };
        assert_eq!(args.mode, EditMode::FullEdit);
        assert_eq!(args.prompt.resolution, ResolutionTier::TwoK);
        assert_eq!(args.from.as_deref(), Some("v1"));
        assert_eq!(args.mask_threshold, DEFAULT_MASK_THRESHOLD);
        assert_eq!(cli.config, PathBuf::from("banana.json"));
        Ok(())
    }

    #[test]
    fn prompt_comes_from_preset_and_text() -> anyhow::Result<()> {
        let mut presets = PromptPresets::new();
        presets.add("golden", "golden hour light")?;

        assert_eq!(
            compose_prompt(&presets, &prompt_args(Some("add fog"), Some("golden")))?,
            "golden hour light\nadd fog"
        );
        assert_eq!(
            compose_prompt(&presets, &prompt_args(None, Some("golden")))?,
            "golden hour light"
        );
        assert!(compose_prompt(&presets, &prompt_args(None, Some("missing"))).is_err());
        assert!(compose_prompt(&presets, &prompt_args(None, None)).is_err());
        Ok(())
    }

    #[test]
    fn history_lines_mark_current_and_parents() -> anyhow::Result<()> {
        let mut history = HistoryStore::new();
        let request = RequestBuilder::new(GenerationMode::DepthRender, "harbour at dawn")
            .base_image(solid(1))
            .build()?;
        let root = history.append(GenerationResult::new(solid(2), request), None)?;
        let edit = RequestBuilder::new(GenerationMode::FullEdit, "add boats")
            .base_image(solid(2))
            .build()?;
        history.append(GenerationResult::new(solid(3), edit), Some(root))?;

        let lines = history_lines(&history);
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("  v1 [depth_render] AUTO 4x4 harbour at dawn"));
        assert!(lines[1].starts_with("* v2 <- v1 [full_edit]"));
        Ok(())
    }

    #[test]
    fn preset_commands_persist_to_the_config_file() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("banana.json");
        run_presets(
            &path,
            PresetCommand::Add {
                name: "noir".to_string(),
                prompt: "black and white".to_string(),
            },
        )?;
        run_presets(
            &path,
            PresetCommand::Update {
                name: "noir".to_string(),
                rename: Some("mono".to_string()),
                prompt: None,
            },
        )?;
        let config = EngineConfig::load(&path)?;
        assert_eq!(config.presets.get("mono"), Some("black and white"));
        assert!(run_presets(&path, PresetCommand::Delete { name: "noir".to_string() }).is_err());
        Ok(())
    }
}
