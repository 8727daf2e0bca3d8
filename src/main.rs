//! Voxpost - record and play voice clips from the terminal
//!
//! This is the main entry point for the voxpost binary.

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use log::{info, warn};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use voxpost::audio::pipewire::{AnalysisContext, PipeWireBackend};
use voxpost::audio::{
    format_time, ClipStore, PlaybackOptions, PlaybackState, RecordingState, VoicePlayer,
    VoiceRecorder,
};
use voxpost::cli::{self, Command};
use voxpost::collab::{FetchCollaborator, HttpCollaborator, UploadTarget};
use voxpost::{settings, AudioError, PipelineConfig};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = cli::Args::parse();
    cli::init_logging(&args);

    info!("Starting voxpost");

    let config = match &args.config {
        Some(path) => PipelineConfig::load_from(path)?,
        None => PipelineConfig::load()?,
    };

    let result = match args.command {
        Command::Record {
            output,
            upload,
            comment_on,
            description,
        } => {
            let target = match comment_on {
                Some(post_id) => Some(UploadTarget::Comment { post_id }),
                None if upload => Some(UploadTarget::Post),
                None => None,
            };
            record(&config, output, target, description, args.token).await
        }
        Command::Play {
            source,
            post,
            volume,
        } => play(&config, &source, post, volume, args.token).await,
        Command::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    };

    AnalysisContext::shutdown();
    result
}

fn audio_error(e: AudioError) -> anyhow::Error {
    anyhow!("{} ({})", e.user_message(), e)
}

/// Like [`audio_error`], with a pointer at the sound server when the
/// microphone itself is the problem
fn start_error(e: AudioError) -> anyhow::Error {
    if e.is_device_error() {
        anyhow!(
            "{} ({}). Is PipeWire running with a capture device connected?",
            e.user_message(),
            e
        )
    } else {
        audio_error(e)
    }
}

fn collaborator(config: &PipelineConfig, token: Option<String>) -> HttpCollaborator {
    let collab = HttpCollaborator::new(&config.backend_origin);
    match token {
        Some(token) => collab.with_token(token),
        None => collab,
    }
}

async fn record(
    config: &PipelineConfig,
    output: Option<PathBuf>,
    target: Option<UploadTarget>,
    description: Option<String>,
    token: Option<String>,
) -> Result<()> {
    let backend = Arc::new(PipeWireBackend::from(config));
    let mut recorder = VoiceRecorder::new(backend, config);

    recorder.start().await.map_err(start_error)?;
    eprintln!("Recording, press Ctrl-C to stop");

    let mut status = recorder.subscribe();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let clip = loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                eprintln!();
                break recorder.stop().map_err(audio_error)?;
            }
            changed = status.changed() => {
                if changed.is_err() {
                    bail!("Recording session went away");
                }
                let current = status.borrow_and_update().clone();
                match current.state {
                    RecordingState::Recording => eprint!(
                        "\r{} / {} left   ",
                        format_time(current.elapsed_seconds as f64),
                        format_time(current.remaining_seconds as f64)
                    ),
                    RecordingState::Stopped => {
                        eprintln!("\nRecording limit reached");
                        break recorder.stop().map_err(audio_error)?;
                    }
                    RecordingState::Idle => {
                        let error = current
                            .error
                            .unwrap_or_else(|| AudioError::EncodingFailure("recording ended".into()));
                        return Err(audio_error(error));
                    }
                    _ => {}
                }
            }
        }
    };

    let path = ClipStore::new()
        .save(&clip, output.as_deref())
        .map_err(|e| anyhow!(e))
        .context("Failed to save recording")?;
    println!(
        "Saved {} ({}) to {}",
        format_time(clip.duration_seconds as f64),
        clip.mime_type,
        path.display()
    );

    if let Some(target) = target {
        let collab = collaborator(config, token);
        let record = recorder
            .send(&collab, &target, description)
            .await
            .context("Failed to upload recording")?;
        println!(
            "Uploaded as {}{}",
            record.id,
            record
                .audio_url
                .map(|url| format!(" ({})", url))
                .unwrap_or_default()
        );
    }

    Ok(())
}

/// Turn an existing local path into a `file://` URL; anything else is passed
/// through for URL resolution
fn local_source(source: &str) -> Result<String> {
    let path = Path::new(source);
    if !path.exists() {
        return Ok(source.to_string());
    }
    let absolute = path
        .canonicalize()
        .with_context(|| format!("Failed to resolve {}", path.display()))?;
    reqwest::Url::from_file_path(&absolute)
        .map(|url| url.to_string())
        .map_err(|_| anyhow!("Cannot build a file URL for {}", absolute.display()))
}

async fn play(
    config: &PipelineConfig,
    source: &str,
    post: bool,
    volume: Option<f32>,
    token: Option<String>,
) -> Result<()> {
    let source = if post {
        let record = collaborator(config, token)
            .fetch_post(source)
            .await
            .with_context(|| format!("Failed to fetch post {}", source))?;
        record
            .audio_url
            .ok_or_else(|| anyhow!("Post {} has no audio", source))?
    } else {
        local_source(source)?
    };

    let options = PlaybackOptions {
        volume: volume
            .map(|v| v.clamp(0.0, 1.0))
            .unwrap_or_else(|| settings::get_volume(config.default_volume)),
        muted: settings::get_muted(),
        ..PlaybackOptions::from(config)
    };

    let backend = Arc::new(PipeWireBackend::from(config));
    let mut player = VoicePlayer::with_options(backend, config, options);
    player.set_source(&source).map_err(audio_error)?;

    let mut status = player.subscribe();
    let loaded = status
        .wait_for(|s| s.state != PlaybackState::Loading)
        .await
        .map(|s| s.clone())
        .context("Player went away while loading")?;
    if loaded.state == PlaybackState::Error {
        let error = loaded
            .error
            .unwrap_or_else(|| AudioError::LoadFailure(source.clone()));
        return Err(audio_error(error));
    }

    eprintln!(
        "Playing {} ({})",
        source,
        format_time(loaded.duration.unwrap_or(0.0))
    );
    player.play().await.map_err(audio_error)?;

    let finished = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            player.pause().map_err(audio_error)?;
            None
        }
        state = player.wait_until_done() => Some(state),
    };

    let status = player.status();
    settings::set_volume(status.volume);
    settings::set_muted(status.muted);

    if finished.is_none() {
        warn!("Stopped at {}", format_time(status.position));
    }
    player.destroy();

    if finished == Some(PlaybackState::Error) {
        let error = status
            .error
            .unwrap_or_else(|| AudioError::LoadFailure("playback failed".into()));
        return Err(audio_error(error));
    }
    Ok(())
}
