//! Task list commands.

use clap::{Args, Subcommand};
use tasksync_core::{CancelToken, TaskRepository};

use super::{print_json, CliResult, Context};

#[derive(Args)]
pub struct ListsArgs {
    #[command(subcommand)]
    action: Option<ListsAction>,
    /// Print lists as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Subcommand)]
pub enum ListsAction {
    /// Create a list
    Create {
        /// List title
        title: String,
    },
    /// Rename a list
    Rename {
        /// List id or title
        list: String,
        /// New title
        title: String,
    },
    /// Delete a list and its tasks
    Delete {
        /// List id or title
        list: String,
    },
    /// Hide completed tasks of a list on the remote
    Clear {
        /// List id or title
        list: String,
    },
}

pub async fn run(args: ListsArgs) -> CliResult {
    let ctx = Context::load()?;

    match args.action {
        None => {
            let lists = ctx.repo.task_lists().await?;
            if args.json {
                return print_json(&lists);
            }
            if lists.is_empty() {
                println!("No task lists.");
            }
            for list in lists {
                println!("{}  {:<14}  {}", list.local_id, list.sync_state.as_str(), list.title);
            }
        }
        Some(ListsAction::Create { title }) => {
            let list = ctx.repo.create_task_list(&title).await?;
            println!("List created: {}", list.local_id);
        }
        Some(ListsAction::Rename { list, title }) => {
            let list = ctx.resolve_list(&list).await?;
            let renamed = ctx.repo.rename_task_list(&list.local_id, &title).await?;
            println!("List renamed: {}", renamed.title);
        }
        Some(ListsAction::Delete { list }) => {
            let list = ctx.resolve_list(&list).await?;
            ctx.repo.delete_task_list(&list.local_id).await?;
            println!("List deleted: {}", list.local_id);
        }
        Some(ListsAction::Clear { list }) => {
            let list = ctx.resolve_list(&list).await?;
            ctx.engine()?
                .clear_completed(&list.local_id, &CancelToken::never())
                .await?;
            println!("Completed tasks cleared remotely; run `tasksync sync now` to refresh.");
        }
    }
    Ok(())
}
