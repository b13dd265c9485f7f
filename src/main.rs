// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result, bail};
use chrono::Utc;
use clap::{Parser, Subcommand};
use colored::Colorize;
use console::Emoji;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use podplay::presentation::{format_time, relative_date, short_duration};
use podplay::{
    Catalog, Config, DownloadCoordinator, DownloadState, EpisodeId, EpisodeQuery, FeedService,
    HttpTransfer, JsonFileBackend, NoopReporter, Orchestrator, PodcastId, ProgressEvent,
    ProgressReporter, ReqwestClient, SharedProgressReporter, StartOutcome, Store, SymphoniaProbe,
    TaskId,
};

// Emoji with fallback for terminals without Unicode support
static MICROPHONE: Emoji<'_, '_> = Emoji("🎙️  ", "");
static SEARCH: Emoji<'_, '_> = Emoji("🔍 ", "[~] ");
static HEADPHONES: Emoji<'_, '_> = Emoji("🎧 ", "[i] ");
static DOWNLOAD: Emoji<'_, '_> = Emoji("📥 ", "[v] ");
static SUCCESS: Emoji<'_, '_> = Emoji("✅ ", "[+] ");
static FAILURE: Emoji<'_, '_> = Emoji("❌ ", "[!] ");
static PARTY: Emoji<'_, '_> = Emoji("🎉 ", "[*] ");
static BOOKMARK: Emoji<'_, '_> = Emoji("🔖 ", "[#] ");
static CROSS: Emoji<'_, '_> = Emoji("✗ ", "x ");

/// Subscribe to podcasts, keep recent episodes downloaded
#[derive(Parser, Debug)]
#[command(name = "podplay")]
#[command(about = "Subscribe to podcasts and keep recent episodes downloaded")]
#[command(version)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Quiet mode - suppress progress output
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Subscribe to a feed (URL or local RSS file)
    Subscribe { feed: String },
    /// Fetch all feeds, download recent episodes, evict listened ones
    Refresh,
    /// List subscribed podcasts
    Podcasts,
    /// List episodes
    Episodes {
        /// Include listened episodes
        #[arg(short, long)]
        all: bool,
        /// Only episodes of this podcast
        #[arg(short, long)]
        podcast: Option<u64>,
    },
    /// Download one episode
    Download { episode: u64 },
    /// Delete the downloaded file of one episode
    Remove { episode: u64 },
    /// Delete all downloaded files
    Clean,
    /// List bookmarks
    Bookmarks,
}

/// Progress reporter using indicatif for terminal output
struct IndicatifReporter {
    multi: MultiProgress,
    bars: Mutex<HashMap<TaskId, ProgressBar>>,
    main_bar: ProgressBar,
}

impl IndicatifReporter {
    fn new() -> Self {
        let multi = MultiProgress::new();

        let main_bar = multi.add(ProgressBar::new_spinner());
        if let Ok(style) = ProgressStyle::default_bar().template("{spinner:.green} {wide_msg}") {
            main_bar.set_style(style);
        }
        main_bar.enable_steady_tick(std::time::Duration::from_millis(100));

        Self {
            multi,
            bars: Mutex::new(HashMap::new()),
            main_bar,
        }
    }

    fn get_or_create_bar(&self, task: TaskId) -> ProgressBar {
        let mut bars = self.bars.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(bar) = bars.get(&task) {
            return bar.clone();
        }

        let bar = self.multi.add(ProgressBar::new(0));
        if let Ok(style) = ProgressStyle::default_bar().template(&format!(
            "  {DOWNLOAD}[{{bar:30.cyan/blue}}] {{bytes}}/{{total_bytes}} {{wide_msg}}"
        )) {
            bar.set_style(style.progress_chars("█▓░"));
        }
        bars.insert(task, bar.clone());
        bar
    }

    fn finish_bar(&self, task: TaskId) {
        let mut bars = self.bars.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(bar) = bars.remove(&task) {
            bar.finish_and_clear();
        }
    }

    fn finish(&self) {
        self.main_bar.finish_and_clear();
    }
}

impl ProgressReporter for IndicatifReporter {
    fn report(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::FetchingFeed { url } => {
                self.main_bar
                    .set_message(format!("{SEARCH}Fetching feed: {}", url.cyan()));
            }

            ProgressEvent::FeedMerged {
                podcast_title,
                total_episodes,
                new_episodes,
            } => {
                self.main_bar.set_message(format!(
                    "{HEADPHONES}{} • {} episodes total, {} new",
                    podcast_title.bold().green(),
                    total_episodes.to_string().cyan(),
                    new_episodes.to_string().yellow()
                ));
            }

            ProgressEvent::TransferStarting {
                task,
                label,
                content_length,
            } => {
                let bar = self.get_or_create_bar(task);
                bar.set_length(content_length.unwrap_or(0));
                bar.set_position(0);
                bar.set_message(truncate_title(&label, 40));
            }

            ProgressEvent::TransferProgress {
                task,
                bytes_downloaded,
                total_bytes,
                ..
            } => {
                let bar = self.get_or_create_bar(task);
                if let Some(total) = total_bytes {
                    bar.set_length(total);
                }
                bar.set_position(bytes_downloaded);
            }

            ProgressEvent::TransferCompleted {
                task,
                label,
                bytes_downloaded,
            } => {
                let bar = self.get_or_create_bar(task);
                bar.set_position(bytes_downloaded);
                bar.set_message(format!("{SUCCESS}{}", truncate_title(&label, 40).green()));
                self.finish_bar(task);
            }

            ProgressEvent::TransferFailed { task, label, error } => {
                let bar = self.get_or_create_bar(task);
                bar.abandon_with_message(format!(
                    "{FAILURE}{} - {}",
                    truncate_title(&label, 30).red(),
                    error.red()
                ));
                self.finish_bar(task);
            }

            ProgressEvent::RefreshCompleted {
                podcasts,
                new_episodes,
                downloads_started,
                evicted,
            } => {
                self.main_bar.set_message(format!(
                    "{PARTY}{} {} podcasts, {} new episodes, {} downloads, {} evicted",
                    "Refresh complete:".bold().green(),
                    podcasts.to_string().green().bold(),
                    new_episodes.to_string().yellow(),
                    downloads_started.to_string().cyan(),
                    evicted.to_string().dimmed()
                ));
            }
        }
    }
}

fn truncate_title(title: &str, max_len: usize) -> String {
    if title.chars().count() <= max_len {
        title.to_string()
    } else {
        let cut: String = title.chars().take(max_len.saturating_sub(3)).collect();
        format!("{cut}...")
    }
}

/// Everything a command needs, wired from the configuration
struct App {
    catalog: Arc<Catalog>,
    downloads: Arc<DownloadCoordinator>,
    orchestrator: Orchestrator,
}

impl App {
    fn build(config: &Config, reporter: SharedProgressReporter) -> Result<Self> {
        let library = config.storage.library_path();
        let first_run = !library.exists();
        let store = Store::open(JsonFileBackend::new(&library))
            .with_context(|| format!("Failed to open library {}", library.display()))?;
        let catalog = Arc::new(Catalog::new(store));
        if first_run {
            catalog
                .set_download_count(config.downloads.keep_per_podcast)
                .context("Failed to initialize settings")?;
        }

        let client = Arc::new(ReqwestClient::new());
        let (transfer, events) = HttpTransfer::new(client.clone(), reporter.clone());
        let downloads = Arc::new(
            DownloadCoordinator::new(
                config.storage.downloads_dir(),
                &config.downloads.audio_extension,
                catalog.clone(),
                Arc::new(transfer),
                Arc::new(SymphoniaProbe),
            )
            .context("Failed to prepare downloads directory")?,
        );
        tokio::spawn(downloads.clone().run(events));

        let orchestrator = Orchestrator::new(
            catalog.clone(),
            downloads.clone(),
            Arc::new(FeedService::new(client)),
            reporter,
            &config.downloads,
            config.playback.default_rate,
        );

        Ok(Self {
            catalog,
            downloads,
            orchestrator,
        })
    }

    /// Block until every transfer in flight reached a terminal state.
    /// Returns (downloaded, failed).
    async fn wait_for_downloads(&self) -> (usize, usize) {
        let (mut downloaded, mut failed) = (0, 0);
        for episode in self.downloads.active_transfers() {
            let mut state = self.downloads.watch_state(episode, false);
            match state.wait_for(|s| s.is_terminal()).await.map(|s| *s) {
                Ok(DownloadState::Downloaded) => downloaded += 1,
                _ => failed += 1,
            }
        }
        (downloaded, failed)
    }

    fn episode(&self, id: u64) -> Result<podplay::Episode> {
        match self.catalog.episode(EpisodeId(id)) {
            Some(episode) => Ok(episode),
            None => bail!("No episode with id {id}"),
        }
    }
}

fn print_download_totals(downloaded: usize, failed: usize) {
    if downloaded + failed == 0 {
        return;
    }
    println!(
        "{PARTY}{} downloaded, {} failed",
        downloaded.to_string().green().bold(),
        if failed > 0 {
            failed.to_string().red().bold()
        } else {
            failed.to_string().green()
        }
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("podplay=info")),
        )
        .init();

    let config = match &args.config {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
    .context("Failed to load configuration")?;

    if !args.quiet {
        println!(
            "\n{}{} {}\n",
            MICROPHONE,
            "podplay".bold().magenta(),
            "- Podcast Player".dimmed()
        );
    }

    let indicatif = (!args.quiet).then(|| Arc::new(IndicatifReporter::new()));
    let reporter: SharedProgressReporter = match &indicatif {
        Some(reporter) => reporter.clone(),
        None => NoopReporter::shared(),
    };

    let app = App::build(&config, reporter)?;

    match args.command {
        Command::Subscribe { feed } => {
            let podcast = app
                .orchestrator
                .subscribe(&feed)
                .await
                .with_context(|| format!("Failed to subscribe to {feed}"))?;
            let (downloaded, failed) = app.wait_for_downloads().await;
            if let Some(reporter) = &indicatif {
                reporter.finish();
            }

            if let Some(podcast) = app.catalog.podcast(podcast) {
                println!(
                    "{SUCCESS}Subscribed to {} (podcast {})",
                    podcast.title.bold().green(),
                    podcast.id.to_string().cyan()
                );
            }
            print_download_totals(downloaded, failed);
        }

        Command::Refresh => {
            let summary = app.orchestrator.refresh().await;
            let (downloaded, failed) = app.wait_for_downloads().await;
            if let Some(reporter) = &indicatif {
                reporter.finish();
            }

            println!(
                "{PARTY}{} {} podcasts, {} new episodes, {} evicted",
                "Refresh complete:".bold().green(),
                summary.podcasts.to_string().green().bold(),
                summary.new_episodes.to_string().yellow(),
                summary.evicted.to_string().dimmed()
            );
            print_download_totals(downloaded, failed);

            if !summary.failed_feeds.is_empty() {
                println!("\n{}", "Failed feeds:".red().bold());
                for (title, error) in &summary.failed_feeds {
                    println!("  {}{} - {}", CROSS, title.yellow(), error.dimmed());
                }
            }
        }

        Command::Podcasts => {
            for podcast in app.catalog.podcasts() {
                let unlistened = app
                    .catalog
                    .query(&EpisodeQuery {
                        podcast: Some(podcast.id),
                        listened: Some(false),
                        ..Default::default()
                    })
                    .len();
                println!(
                    "{:>4}  {}  {}  {}",
                    podcast.id.to_string().cyan(),
                    podcast.title.bold(),
                    format!("{unlistened} unlistened").yellow(),
                    format!("{}x", podcast.playback_rate).dimmed()
                );
            }
        }

        Command::Episodes { all, podcast } => {
            let query = EpisodeQuery {
                podcast: podcast.map(PodcastId),
                listened: (!all).then_some(false),
                ..Default::default()
            };
            let now = Utc::now();
            for episode in app.catalog.query(&query) {
                let marker = if app.downloads.download_file_exists(&episode) {
                    DOWNLOAD.to_string()
                } else {
                    "   ".to_string()
                };
                let date = episode
                    .published_at
                    .map(|at| relative_date(at, now))
                    .unwrap_or_default();
                let title = if episode.listened {
                    episode.title.dimmed()
                } else {
                    episode.title.bold()
                };
                println!(
                    "{:>5}  {marker}{:<12} {}  {}",
                    episode.id.to_string().cyan(),
                    date,
                    title,
                    short_duration(episode.duration).dimmed()
                );
            }
        }

        Command::Download { episode } => {
            let episode = app.episode(episode)?;
            match app.downloads.start_download(&episode) {
                StartOutcome::Started(_) => {
                    let (downloaded, failed) = app.wait_for_downloads().await;
                    if let Some(reporter) = &indicatif {
                        reporter.finish();
                    }
                    print_download_totals(downloaded, failed);
                    if failed > 0 {
                        std::process::exit(1);
                    }
                }
                StartOutcome::AlreadyDownloaded => {
                    println!("{SUCCESS}{} is already downloaded", episode.title.bold());
                }
                StartOutcome::AlreadyActive => {
                    println!("{DOWNLOAD}{} is already downloading", episode.title.bold());
                }
                StartOutcome::InvalidUrl => {
                    bail!("Episode {} has an invalid enclosure URL", episode.id);
                }
            }
        }

        Command::Remove { episode } => {
            let episode = app.episode(episode)?;
            if app.downloads.remove_download(&episode).await {
                println!("{SUCCESS}Removed {}", episode.title.bold());
            } else {
                println!("Nothing to remove for {}", episode.title.bold());
            }
        }

        Command::Clean => {
            let summary = app.downloads.delete_all_downloads().await;
            println!(
                "{SUCCESS}Deleted {} file(s), {} failed",
                summary.removed.to_string().green().bold(),
                summary.failed.to_string().red()
            );
        }

        Command::Bookmarks => {
            for bookmark in app.catalog.bookmarks() {
                let title = app
                    .catalog
                    .episode(bookmark.episode_id)
                    .map(|e| e.title)
                    .unwrap_or_else(|| format!("episode {}", bookmark.episode_id));
                println!(
                    "{BOOKMARK}{}  {}  {}",
                    format_time(bookmark.position as f64).cyan(),
                    title.bold(),
                    bookmark.created_at.format("%Y-%m-%d %H:%M").to_string().dimmed()
                );
            }
        }
    }

    if let Some(reporter) = &indicatif {
        reporter.finish();
    }
    Ok(())
}
