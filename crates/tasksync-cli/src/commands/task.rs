//! Task management commands for CLI.

use clap::Subcommand;
use tasksync_core::{NewTask, TaskFilter, TaskItem, TaskPatch, TaskRepository, TaskStatus};

use super::{parse_due, print_json, CliResult, Context};

#[derive(Subcommand)]
pub enum TaskAction {
    /// List tasks of a list
    List {
        /// List id or title
        list: String,
        /// Include completed tasks
        #[arg(long)]
        all: bool,
        #[arg(long)]
        json: bool,
    },
    /// Show one task as JSON
    Show {
        /// Task ID
        id: String,
    },
    /// Add a task
    Add {
        /// List id or title
        list: String,
        /// Task title
        title: String,
        #[arg(long)]
        notes: Option<String>,
        /// Due date (YYYY-MM-DD or RFC 3339)
        #[arg(long)]
        due: Option<String>,
        /// Parent task ID
        #[arg(long)]
        parent: Option<String>,
        /// Place after this sibling task ID
        #[arg(long)]
        after: Option<String>,
    },
    /// Edit a task
    Edit {
        /// Task ID
        id: String,
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        notes: Option<String>,
        /// Due date, or "none" to clear it
        #[arg(long)]
        due: Option<String>,
    },
    /// Mark a task completed
    Done {
        /// Task ID
        id: String,
    },
    /// Mark a task as needing action again
    Undo {
        /// Task ID
        id: String,
    },
    /// Delete a task and its subtasks
    Delete {
        /// Task ID
        id: String,
    },
    /// Move a task under another parent or after a sibling
    Move {
        /// Task ID
        id: String,
        /// New parent task ID (top level when omitted)
        #[arg(long)]
        parent: Option<String>,
        /// Place after this sibling task ID (first when omitted)
        #[arg(long)]
        after: Option<String>,
    },
    /// Search titles and notes
    Search {
        query: String,
        #[arg(long)]
        json: bool,
    },
    /// Filter tasks across lists
    Filter {
        /// Restrict to one list (id or title)
        #[arg(long)]
        list: Option<String>,
        /// Due today
        #[arg(long)]
        today: bool,
        /// Due before today
        #[arg(long)]
        overdue: bool,
        /// Without a due date
        #[arg(long)]
        no_due: bool,
        /// Only completed tasks
        #[arg(long)]
        completed: bool,
        #[arg(long)]
        json: bool,
    },
}

fn print_tasks(tasks: &[TaskItem], json: bool) -> CliResult {
    if json {
        return print_json(&tasks);
    }
    if tasks.is_empty() {
        println!("No tasks.");
    }
    for task in tasks {
        let check = if task.is_completed() { "x" } else { " " };
        let indent = if task.parent_id.is_some() { "  " } else { "" };
        let due = task
            .due
            .map(|d| format!("  (due {})", d.format("%Y-%m-%d")))
            .unwrap_or_default();
        println!("{indent}[{check}] {}  {}{due}", task.local_id, task.title);
    }
    Ok(())
}

fn status_patch(status: TaskStatus) -> TaskPatch {
    TaskPatch {
        status: Some(status),
        ..Default::default()
    }
}

pub async fn run(action: TaskAction) -> CliResult {
    let ctx = Context::load()?;
    let repo = &ctx.repo;

    match action {
        TaskAction::List { list, all, json } => {
            let list = ctx.resolve_list(&list).await?;
            let tasks: Vec<TaskItem> = repo
                .tasks(&list.local_id)
                .await?
                .into_iter()
                .filter(|t| all || !t.is_completed())
                .collect();
            print_tasks(&tasks, json)?;
        }
        TaskAction::Show { id } => {
            let task = repo
                .task(&id)
                .await?
                .ok_or_else(|| format!("task not found: {id}"))?;
            print_json(&task)?;
        }
        TaskAction::Add {
            list,
            title,
            notes,
            due,
            parent,
            after,
        } => {
            let list = ctx.resolve_list(&list).await?;
            let new = NewTask {
                title,
                notes: notes.unwrap_or_default(),
                due: due.as_deref().map(parse_due).transpose()?,
                parent_id: parent,
                previous_id: after,
            };
            let task = repo.create_task(&list.local_id, new).await?;
            println!("Task created: {}", task.local_id);
        }
        TaskAction::Edit {
            id,
            title,
            notes,
            due,
        } => {
            let due = match due.as_deref() {
                None => None,
                Some("none") => Some(None),
                Some(s) => Some(Some(parse_due(s)?)),
            };
            let patch = TaskPatch {
                title,
                notes,
                status: None,
                due,
            };
            if patch.is_empty() {
                return Err("nothing to change: pass --title, --notes or --due".into());
            }
            let task = repo.update_task(&id, patch).await?;
            println!("Task updated: {}", task.local_id);
        }
        TaskAction::Done { id } => {
            repo.update_task(&id, status_patch(TaskStatus::Completed)).await?;
            println!("Task completed: {id}");
        }
        TaskAction::Undo { id } => {
            repo.update_task(&id, status_patch(TaskStatus::NeedsAction)).await?;
            println!("Task reopened: {id}");
        }
        TaskAction::Delete { id } => {
            repo.delete_task(&id).await?;
            println!("Task deleted: {id}");
        }
        TaskAction::Move { id, parent, after } => {
            let task = repo
                .move_task(&id, parent.as_deref(), after.as_deref())
                .await?;
            println!("Task moved: {}", task.local_id);
        }
        TaskAction::Search { query, json } => {
            let tasks = repo.search_tasks(&query).await?;
            print_tasks(&tasks, json)?;
        }
        TaskAction::Filter {
            list,
            today,
            overdue,
            no_due,
            completed,
            json,
        } => {
            let list_id = match list {
                Some(list) => Some(ctx.resolve_list(&list).await?.local_id),
                None => None,
            };
            let filter = TaskFilter {
                list_id,
                completed: completed.then_some(true),
                today_only: today,
                overdue_only: overdue,
                no_due_date: no_due,
                ..Default::default()
            };
            let tasks = repo.tasks_by_filter(&filter).await?;
            print_tasks(&tasks, json)?;
        }
    }
    Ok(())
}
