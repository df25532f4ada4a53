//! Sync subcommand: run cycles against the remote service and inspect the
//! pending-change ledger.

use std::sync::Arc;
use std::time::Duration;

use clap::Subcommand;
use tasksync_core::{
    BackgroundSync, CancelSource, SyncEngine, SyncResult, SyncState, TaskRepository,
};
use tokio::sync::broadcast::error::RecvError;

use super::{print_json, CliResult, Context};

#[derive(Subcommand)]
pub enum SyncAction {
    /// Push local changes, then pull remote state
    Now,
    /// Push local changes only
    Push,
    /// Pull remote state only
    Pull,
    /// Sync on an interval and print progress until Ctrl-C
    Watch {
        /// Seconds between cycles (defaults to sync.interval_secs)
        #[arg(long)]
        interval: Option<u64>,
    },
    /// Show pending and conflicting entities
    Status,
    /// List ledger entries waiting to be pushed
    Pending {
        #[arg(long)]
        json: bool,
    },
    /// Re-arm a ledger entry that ran out of attempts
    Retry {
        /// Ledger entry id
        change_id: i64,
    },
}

pub async fn run(action: SyncAction) -> CliResult {
    let ctx = Context::load()?;

    match action {
        SyncAction::Now => {
            let engine = ctx.engine()?;
            let result = with_ctrl_c(|cancel| async move { engine.sync(&cancel).await }).await;
            report(&result)
        }
        SyncAction::Push => {
            let engine = ctx.engine()?;
            let result = with_ctrl_c(|cancel| async move { engine.push(&cancel).await }).await;
            report(&result)
        }
        SyncAction::Pull => {
            let engine = ctx.engine()?;
            let result = with_ctrl_c(|cancel| async move { engine.pull(&cancel).await }).await;
            report(&result)
        }
        SyncAction::Watch { interval } => {
            let interval = match interval {
                Some(secs) => Duration::from_secs(secs),
                None => ctx.config.sync.interval(),
            };
            watch(ctx.engine()?, interval, ctx.config.sync.sync_on_start).await
        }
        SyncAction::Status => status(&ctx).await,
        SyncAction::Pending { json } => {
            let changes = ctx.repo.pending_changes().await?;
            if json {
                return print_json(&changes);
            }
            if changes.is_empty() {
                println!("Nothing to push.");
            }
            for change in changes {
                let error = change.last_error.as_deref().unwrap_or("");
                println!(
                    "#{:<5} {:<32} attempts={} {}",
                    change.id,
                    change.describe(),
                    change.attempts,
                    error
                );
            }
            Ok(())
        }
        SyncAction::Retry { change_id } => {
            ctx.repo.reset_change_attempts(change_id).await?;
            println!("Change #{change_id} will be retried on the next sync.");
            Ok(())
        }
    }
}

/// Run `f` with a token that fires on Ctrl-C.
async fn with_ctrl_c<F, Fut>(f: F) -> SyncResult
where
    F: FnOnce(tasksync_core::CancelToken) -> Fut,
    Fut: std::future::Future<Output = SyncResult>,
{
    let source = Arc::new(CancelSource::new());
    let token = source.token();
    let watcher = {
        let source = source.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                source.cancel();
            }
        })
    };
    let result = f(token).await;
    watcher.abort();
    result
}

fn report(result: &SyncResult) -> CliResult {
    println!(
        "pushed {}, pulled {}, conflicts {}",
        result.items_pushed, result.items_pulled, result.conflicts
    );
    for error in &result.errors {
        eprintln!("  {error}");
    }
    if result.success {
        Ok(())
    } else {
        Err(format!("sync finished with {} error(s)", result.errors.len()).into())
    }
}

async fn watch(engine: Arc<SyncEngine>, interval: Duration, sync_on_start: bool) -> CliResult {
    let mut events = engine.subscribe();
    let background = BackgroundSync::new(engine.clone());
    background.start(interval)?;
    println!("Syncing every {}s; Ctrl-C to stop.", interval.as_secs());

    if sync_on_start {
        let engine = engine.clone();
        tokio::spawn(async move { engine.sync(&tasksync_core::CancelToken::never()).await });
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(event) => println!("[{:>3}%] {}", event.progress, event.message),
                Err(RecvError::Lagged(skipped)) => eprintln!("({skipped} status events skipped)"),
                Err(RecvError::Closed) => break,
            },
        }
    }
    background.stop();
    Ok(())
}

async fn status(ctx: &Context) -> CliResult {
    let pending = ctx.repo.pending_change_count().await?;
    let lists = ctx.repo.task_lists().await?;
    let mut by_state: Vec<(SyncState, usize)> = Vec::new();
    let mut bump = |state: SyncState| match by_state.iter_mut().find(|(s, _)| *s == state) {
        Some((_, n)) => *n += 1,
        None => by_state.push((state, 1)),
    };
    for list in &lists {
        bump(list.sync_state);
        for task in ctx.repo.tasks(&list.local_id).await? {
            bump(task.sync_state);
        }
    }

    println!("pending changes: {pending}");
    for (state, count) in by_state {
        println!("  {:<14} {count}", state.as_str());
    }
    Ok(())
}
