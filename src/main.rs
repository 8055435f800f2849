use anyhow::{anyhow, Context, Result};
use charforge::core::config::Config;
use charforge::core::editor::QUICK_ACTIONS;
use charforge::core::io::{NativeStorage, Storage};
use charforge::core::session::{load_session, session_channel};
use charforge::core::state::{ArtStyle, HistoryRecord, PromptSpec, UploadedImage};
use charforge::services::narration::{NarrationController, NarrationState};
use charforge::services::workflow::ForgeWorkflow;
use charforge::utils::image::{encode_payload, sniff_mime};
use indicatif::{ProgressBar, ProgressStyle};
use inquire::{Confirm, Select, Text};
use log::{info, warn};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

const MENU: [&str; 13] = [
    "Create character",
    "More variations",
    "Dossier",
    "Foil character",
    "Origin story",
    "Narrate origin story",
    "Refine image",
    "Undo last refinement",
    "Rename record",
    "Conversational editor",
    "Export image",
    "Suggest scenes",
    "Quit",
];

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let config = match Config::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading config: {}", e);
            eprintln!("Please fix 'config.yml' or remove it to use the defaults.");
            return Err(e);
        }
    };
    if config.gemini.api_key.is_none() {
        warn!("No Gemini API key configured. Set GEMINI_API_KEY or add it to config.yml.");
    }

    let storage: Arc<dyn Storage> = Arc::new(NativeStorage::new());
    let restored = load_session(storage.as_ref(), &config.session_folder).await;
    let (persister, writer) = session_channel(storage.clone(), &config.session_folder);
    let writer = tokio::spawn(writer.run());

    let workflow = ForgeWorkflow::from_config(&config).with_session(restored, Some(Arc::new(persister)));
    let result = run_menu(&workflow, storage.as_ref(), &config).await;

    // Dropping the workflow closes the channel so the writer drains and exits.
    drop(workflow);
    if let Err(e) = writer.await {
        warn!("Session writer stopped abnormally: {}", e);
    }
    result
}

async fn run_menu(workflow: &ForgeWorkflow, storage: &dyn Storage, config: &Config) -> Result<()> {
    let mut narration = NarrationController::new();
    loop {
        print_history(workflow);
        let choice = Select::new("What next?", MENU.to_vec()).prompt()?;
        let outcome = match choice {
            "Create character" => create_character(workflow, storage).await,
            "More variations" => more_variations(workflow).await,
            "Dossier" => dossier(workflow).await,
            "Foil character" => foil(workflow).await,
            "Origin story" => origin_story(workflow).await,
            "Narrate origin story" => narrate(workflow, storage, config, &mut narration).await,
            "Refine image" => refine(workflow).await,
            "Undo last refinement" => undo(workflow),
            "Rename record" => rename(workflow),
            "Conversational editor" => editor(workflow, storage).await,
            "Export image" => export(workflow, storage, config).await,
            "Suggest scenes" => suggest(workflow).await,
            _ => return Ok(()),
        };
        if let Err(e) = outcome {
            eprintln!("Error: {:#}", e);
        }
    }
}

fn print_history(workflow: &ForgeWorkflow) {
    let records = workflow.records();
    if records.is_empty() {
        println!("\nNo characters yet.");
        return;
    }
    println!("\nHistory:");
    for record in &records {
        let callsign = record
            .ready_dossier()
            .map(|d| format!(" [{}]", d.callsign))
            .unwrap_or_default();
        println!(
            "  {} {}{} ({} images)",
            record.created_at.format("%H:%M"),
            record.prompt.display_title(),
            callsign,
            record.images.len()
        );
    }
}

/// Shows a spinner while `task` runs.
async fn with_spinner<T>(message: &str, task: impl Future<Output = T>) -> T {
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.green} [{elapsed_precise}] {msg}") {
        pb.set_style(style);
    }
    pb.set_message(message.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    let out = task.await;
    pb.finish_and_clear();
    out
}

fn pick_record(workflow: &ForgeWorkflow) -> Result<HistoryRecord> {
    let records = workflow.records();
    if records.is_empty() {
        return Err(anyhow!("No characters yet"));
    }
    let labels: Vec<String> = records
        .iter()
        .enumerate()
        .map(|(i, r)| format!("{}. {}", i + 1, r.prompt.display_title()))
        .collect();
    let chosen = Select::new("Which character?", labels.clone()).prompt()?;
    let index = labels.iter().position(|l| *l == chosen).unwrap_or(0);
    Ok(records[index].clone())
}

fn pick_image(workflow: &ForgeWorkflow) -> Result<String> {
    let record = pick_record(workflow)?;
    let labels: Vec<String> = record
        .images
        .iter()
        .enumerate()
        .map(|(i, img)| format!("Image {} ({} versions)", i + 1, img.version_count()))
        .collect();
    if labels.is_empty() {
        return Err(anyhow!("That record has no images"));
    }
    let chosen = Select::new("Which image?", labels.clone()).prompt()?;
    let index = labels.iter().position(|l| *l == chosen).unwrap_or(0);
    Ok(record.images[index].id.clone())
}

fn pick_style() -> Result<ArtStyle> {
    let labels: Vec<&str> = ArtStyle::ALL.iter().map(|s| s.label()).collect();
    let chosen = Select::new("Art style:", labels).prompt()?;
    Ok(ArtStyle::from_label(&chosen).unwrap_or(ArtStyle::Custom))
}

async fn read_upload(storage: &dyn Storage, path: &str) -> Result<UploadedImage> {
    let bytes = storage.read(path).await?;
    let mime_type = sniff_mime(&bytes).ok_or_else(|| anyhow!("{} is not a PNG, JPEG, GIF or WebP image", path))?;
    Ok(UploadedImage {
        b64: encode_payload(&bytes),
        mime_type: mime_type.to_string(),
    })
}

async fn create_character(workflow: &ForgeWorkflow, storage: &dyn Storage) -> Result<()> {
    let character = Text::new("Describe the character:").prompt()?;
    let scene = Text::new("Scene, outfit or action:").prompt()?;
    let style = pick_style()?;
    let mut prompt = PromptSpec::new(character, scene, style);
    let reference = Text::new("Reference image path (blank for none):").prompt()?;
    if !reference.trim().is_empty() {
        prompt.reference_image = Some(read_upload(storage, reference.trim()).await?);
    }
    let with_dossier = Confirm::new("Generate a dossier too?").with_default(true).prompt()?;

    let outcome = with_spinner("Generating images...", workflow.generate(prompt, with_dossier)).await?;
    println!("Created {}", outcome.record_id);
    if let Some(e) = outcome.dossier_error {
        println!("Images are ready but the dossier failed: {}", e.user_message());
    }
    Ok(())
}

async fn more_variations(workflow: &ForgeWorkflow) -> Result<()> {
    let record = pick_record(workflow)?;
    let count = with_spinner("Generating variations...", workflow.generate_variations(&record.id)).await?;
    println!("Added {} images", count);
    Ok(())
}

async fn dossier(workflow: &ForgeWorkflow) -> Result<()> {
    let record = pick_record(workflow)?;
    if record.ready_dossier().is_none() {
        with_spinner("Compiling dossier...", workflow.generate_dossier(&record.id)).await?;
    }
    let record = workflow
        .with_store(|s| s.get(&record.id).cloned())
        .ok_or_else(|| anyhow!("Record disappeared"))?;
    if let Some(d) = record.ready_dossier() {
        println!("\n{}\n{}", d.callsign, d.background);
        println!("Abilities: {}", d.abilities.join(", "));
        println!("Weaknesses: {}", d.weaknesses.join(", "));
        println!("\"{}\"", d.quote);
        if let Some(story) = d.written_origin_story() {
            println!("\n{}", story);
        }
    }
    Ok(())
}

async fn foil(workflow: &ForgeWorkflow) -> Result<()> {
    let record = pick_record(workflow)?;
    let foil_id = with_spinner("Generating foil character...", workflow.generate_foil(&record.id)).await?;
    println!("Created foil {}", foil_id);
    Ok(())
}

async fn origin_story(workflow: &ForgeWorkflow) -> Result<()> {
    let record = pick_record(workflow)?;
    let story = with_spinner("Writing origin story...", workflow.generate_origin_story(&record.id)).await?;
    println!("\n{}", story);
    Ok(())
}

async fn narrate(
    workflow: &ForgeWorkflow,
    storage: &dyn Storage,
    config: &Config,
    narration: &mut NarrationController,
) -> Result<()> {
    let record = pick_record(workflow)?;
    let ticket = narration.begin(&record.id);
    let cancel = ticket.token.clone();
    let outcome = with_spinner("Narrating (Ctrl-C to stop)...", async {
        tokio::select! {
            out = workflow.narrate_origin_story(&record.id, ticket.token.clone()) => out,
            _ = tokio::signal::ctrl_c() => {
                cancel.cancel();
                Err(charforge::core::error::ForgeError::Cancelled)
            }
        }
    })
    .await;
    narration.finish(&ticket, outcome);

    match narration.state() {
        NarrationState::Ready => {
            if let Some(clip) = narration.clip() {
                let path = format!("{}/narration-{}.mp3", config.session_folder, record.id);
                storage.write(&path, &clip.bytes).await?;
                println!("Saved narration to {}", path);
            }
        }
        NarrationState::Failed(message) => println!("Narration failed: {}", message),
        _ => println!("Narration stopped"),
    }
    Ok(())
}

async fn refine(workflow: &ForgeWorkflow) -> Result<()> {
    let image_id = pick_image(workflow)?;
    let mut session = workflow.open_refinement(&image_id)?;
    loop {
        let instruction = Text::new("Refinement (blank to finish):").prompt()?;
        if instruction.trim().is_empty() {
            break;
        }
        match with_spinner("Refining...", workflow.refine(&mut session, &instruction)).await {
            Ok(()) => println!("Version {} ready", session.branch().len()),
            Err(e) => println!("Refinement failed: {}", e.user_message()),
        }
    }
    if session.has_changes() && Confirm::new("Save these versions?").with_default(true).prompt()? {
        workflow.commit_refinement(session)?;
        println!("Saved");
    }
    Ok(())
}

fn undo(workflow: &ForgeWorkflow) -> Result<()> {
    let image_id = pick_image(workflow)?;
    if workflow.undo_version(&image_id)? {
        println!("Reverted to the previous version");
    } else {
        println!("Nothing to undo");
    }
    Ok(())
}

fn rename(workflow: &ForgeWorkflow) -> Result<()> {
    let record = pick_record(workflow)?;
    let title = Text::new("New title:")
        .with_initial_value(record.prompt.display_title())
        .prompt()?;
    workflow.update_title(&record.id, &title);
    Ok(())
}

async fn editor(workflow: &ForgeWorkflow, storage: &dyn Storage) -> Result<()> {
    if workflow.with_editor(|e| e.base_image().is_none()) {
        let source = Select::new("Start from:", vec!["Image file", "Generated image"]).prompt()?;
        if source == "Image file" {
            let path = Text::new("Image path:").prompt()?;
            workflow.load_editor_image(read_upload(storage, path.trim()).await?)?;
        } else {
            workflow.send_to_editor(&pick_image(workflow)?)?;
        }
    }

    loop {
        workflow.with_editor(|e| {
            for message in e.transcript().messages() {
                println!("  {:?}: {}", message.role, message.text);
            }
        });
        let action = Select::new(
            "Editor:",
            vec!["Instruction", "Quick action", "Edit earlier message", "Save to history", "Start over", "Back"],
        )
        .prompt()?;
        let result = match action {
            "Instruction" => {
                let text = Text::new("Instruction:").prompt()?;
                with_spinner("Editing...", workflow.editor_send(&text)).await.map(|_| ())
            }
            "Quick action" => {
                let label = Select::new("Action:", QUICK_ACTIONS.to_vec()).prompt()?;
                with_spinner("Editing...", workflow.editor_quick_action(label)).await.map(|_| ())
            }
            "Edit earlier message" => {
                let users: Vec<(String, String)> = workflow.with_editor(|e| {
                    e.transcript()
                        .messages()
                        .iter()
                        .filter(|m| m.input_image.is_some())
                        .map(|m| (m.id.clone(), m.text.clone()))
                        .collect()
                });
                if users.is_empty() {
                    continue;
                }
                let labels: Vec<String> = users.iter().map(|(_, text)| text.clone()).collect();
                let chosen = Select::new("Which message?", labels.clone()).prompt()?;
                let index = labels.iter().position(|l| *l == chosen).unwrap_or(0);
                let text = Text::new("New text:").with_initial_value(&chosen).prompt()?;
                with_spinner("Editing...", workflow.editor_edit(&users[index].0, &text))
                    .await
                    .map(|_| ())
            }
            "Save to history" => {
                let description = Text::new("Description:").prompt()?;
                let id = workflow.save_editor_result(&description)?;
                println!("Saved as {}", id);
                Ok(())
            }
            "Start over" => {
                workflow.editor_start_over();
                return Ok(());
            }
            _ => return Ok(()),
        };
        if let Err(e) = result {
            println!("Edit failed: {}", e.user_message());
        }
    }
}

async fn export(workflow: &ForgeWorkflow, storage: &dyn Storage, config: &Config) -> Result<()> {
    let image_id = pick_image(workflow)?;
    let folder = format!("{}/exports", config.session_folder);
    let path = workflow
        .export_image(storage, &folder, &image_id)
        .await
        .context("Export failed")?;
    info!("Exported {}", path);
    println!("Saved {}", path);
    Ok(())
}

async fn suggest(workflow: &ForgeWorkflow) -> Result<()> {
    let character = Text::new("Describe the character:").prompt()?;
    let style = pick_style()?;
    let scenes = with_spinner("Thinking...", workflow.suggest_scenes(&character, style, None)).await?;
    for scene in scenes {
        println!("  - {}", scene);
    }
    Ok(())
}
