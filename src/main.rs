use clicker_sync::{
    HttpGameClient,
    InMemoryCache,
    PlayerId,
    PollingScheduler,
    SessionContext,
    SledCache,
    SnapshotCache,
    SyncConfig,
    SyncController,
    controller::{
        NoticeLevel,
        Notification,
    },
};
use color_eyre::eyre::{
    Result,
    WrapErr,
    eyre,
};
use std::{
    path::{
        Path,
        PathBuf,
    },
    sync::Arc,
};
use tracing_appender::{
    non_blocking::WorkerGuard,
    rolling,
};
use tracing_subscriber::{
    EnvFilter,
    fmt,
};

const LOG_DIR: &str = "logs";

struct RunnerArgs {
    config: SyncConfig,
    player_id: Option<PlayerId>,
}

fn print_usage_and_exit() -> ! {
    println!(
        "Usage: clicker-sync [--server-url <url>] [--cache-dir <path>]\n\
         [--player-id <id>] [--click-cost <n>]\n\
         \n\
         Flags:\n\
           --server-url <url>  Game server base URL (default {})\n\
           --cache-dir <path>  Keep the snapshot cache on disk at <path>\n\
           --player-id <id>    Resume an existing player instead of a new one\n\
           --click-cost <n>    Energy spent per click (default {})",
        clicker_sync::config::DEFAULT_SERVER_URL,
        clicker_sync::snapshot::DEFAULT_CLICK_COST,
    );
    std::process::exit(0);
}

fn parse_cli_args() -> Result<RunnerArgs> {
    let mut args = std::env::args().skip(1);
    let mut config = SyncConfig::default();
    let mut player_id = None;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--server-url" => {
                let url = args
                    .next()
                    .ok_or_else(|| eyre!("--server-url requires a URL argument"))?;
                config = config.with_server_url(url);
            }
            "--cache-dir" => {
                let dir = args
                    .next()
                    .ok_or_else(|| eyre!("--cache-dir requires a path argument"))?;
                config = config.with_cache_dir(PathBuf::from(dir));
            }
            "--player-id" => {
                let id = args
                    .next()
                    .ok_or_else(|| eyre!("--player-id requires an identity argument"))?;
                if player_id.is_some() {
                    return Err(eyre!("--player-id may only be specified once"));
                }
                player_id = Some(PlayerId::new(id));
            }
            "--click-cost" => {
                let raw = args
                    .next()
                    .ok_or_else(|| eyre!("--click-cost requires a number"))?;
                let cost = raw
                    .parse::<u32>()
                    .wrap_err_with(|| format!("invalid --click-cost value {raw:?}"))?;
                config = config.with_click_cost(cost);
            }
            "--help" | "-h" => print_usage_and_exit(),
            other => return Err(eyre!("Unknown argument: {other}")),
        }
    }

    Ok(RunnerArgs { config, player_id })
}

fn init_tracing(log_dir: &Path) -> Result<WorkerGuard> {
    let file_appender = rolling::daily(log_dir, "clicker-sync.log");
    let (writer, guard) = tracing_appender::non_blocking(file_appender);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .try_init()
        .map_err(|e| eyre!("installing tracing subscriber failed: {e}"))?;
    Ok(guard)
}

fn open_cache(config: &SyncConfig) -> Result<Arc<dyn SnapshotCache>> {
    match &config.cache_dir {
        Some(dir) => {
            let cache = SledCache::open(dir)
                .wrap_err_with(|| format!("opening snapshot cache at {}", dir.display()))?;
            Ok(Arc::new(cache))
        }
        None => Ok(Arc::new(InMemoryCache::new())),
    }
}

fn print_notification(notification: &Notification) {
    let tag = match notification.level {
        NoticeLevel::Info => "info",
        NoticeLevel::Success => "ok",
        NoticeLevel::Error => "error",
    };
    println!("[{tag}] {}", notification.message);
}

async fn run(args: RunnerArgs) -> Result<()> {
    let RunnerArgs { config, player_id } = args;
    let session = match player_id {
        Some(id) => SessionContext::for_player(id),
        None => SessionContext::generate(),
    };
    tracing::info!(player = %session.player_id(), server = %config.server_url, "starting session");

    let server = HttpGameClient::new(config.server_url.clone())?;
    let cache = open_cache(&config)?;
    let (controller, mut notices) = SyncController::new(session, server, cache, &config);
    let mut views = controller.subscribe();

    if let Err(err) = controller.bootstrap().await {
        tracing::warn!(%err, "initial fetch failed; continuing with cached state");
        println!("initial fetch failed: {}", err.user_message());
    }
    let scheduler = PollingScheduler::start(controller.clone(), &config);

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            res = &mut shutdown => {
                res.wrap_err("listening for ctrl-c failed")?;
                break;
            }
            changed = views.changed() => {
                if changed.is_err() {
                    break;
                }
                let view = views.borrow_and_update().clone();
                if let Some(view) = view {
                    let s = &view.snapshot;
                    tracing::info!(
                        origin = ?view.origin,
                        points = s.points,
                        energy = s.energy,
                        upgrade_level = s.upgrade_level,
                        character = %s.character_name,
                        "snapshot updated"
                    );
                    println!(
                        "{} | {} pts | energy {}/{} | upgrade {} (next {}) | {}",
                        s.identity,
                        s.points_formatted,
                        s.energy,
                        s.max_energy,
                        s.upgrade_level,
                        s.next_upgrade_cost_formatted,
                        s.character_name,
                    );
                }
            }
            Some(notice) = notices.recv() => print_notification(&notice),
        }
    }

    scheduler.shutdown().await;
    tracing::info!("session ended");
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let _log_guard = init_tracing(Path::new(LOG_DIR))?;
    let args = parse_cli_args()?;
    run(args).await
}
