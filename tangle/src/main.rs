//! Console archiver for branching interactive stories.
//!
//! A line-oriented menu over [`tangle_core::PortalSession`]: log in, load a
//! story skeleton by id, explore the tree, download chapters (one, a
//! branch, or all), and save or reload the archive file.
//!
//! Portal credentials can be set in the environment (or a `.env` file) as
//! `PORTAL_USERNAME` / `PORTAL_PASSWORD`; the login action falls back to
//! prompting.
//!
//! While a download batch runs, Ctrl-C cancels it cooperatively: the
//! chapter in flight finishes (or keeps its busy-wait until the boundary),
//! later chapters are not started, and the summary reports whatever was
//! done.

use std::io::Write as _;
use std::time::Duration;

use tangle_core::{
    DownloadOptions, DownloadProgress, NodeIndex, PortalSession, SessionError, Story,
};
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mut console = Console::new();
    console.run().await;
    Ok(())
}

struct Console {
    session: PortalSession,
    input: Lines<BufReader<Stdin>>,
}

impl Console {
    fn new() -> Self {
        Self {
            session: PortalSession::new(),
            input: BufReader::new(tokio::io::stdin()).lines(),
        }
    }

    async fn run(&mut self) {
        println!("** tangle - interactive story archiver **");
        loop {
            println!();
            println!("1) Login");
            println!("2) Load story by id");
            println!("3) Story info");
            println!("4) Explore chapters");
            println!("5) Download all chapters");
            println!("6) Download a branch");
            println!("7) Download one chapter");
            println!("8) Save archive");
            println!("9) Open archive");
            println!("10) Export JSON");
            println!("q) Quit");

            let Some(action) = self.prompt("Enter action: ").await else {
                break;
            };
            let result = match action.as_str() {
                "1" => self.login().await,
                "2" => self.load_story().await,
                "3" => self.story_info(),
                "4" => self.explore().await,
                "5" => self.download(DownloadKind::All).await,
                "6" => self.download(DownloadKind::Branch).await,
                "7" => self.download(DownloadKind::One).await,
                "8" => self.save().await,
                "9" => self.open().await,
                "10" => self.export_json().await,
                "q" | "Q" => {
                    println!("Goodbye!");
                    break;
                }
                _ => {
                    println!("Invalid input");
                    Ok(())
                }
            };
            if let Err(e) = result {
                println!("Error: {e}");
            }
        }
    }

    /// Print a prompt and read one trimmed line; `None` on closed stdin.
    async fn prompt(&mut self, message: &str) -> Option<String> {
        print!("{message}");
        let _ = std::io::stdout().flush();
        let line = self.input.next_line().await.ok()??;
        Some(line.trim().to_string())
    }

    async fn login(&mut self) -> Result<(), SessionError> {
        let (username, password) = match portal::Portal::credentials_from_env() {
            Ok(creds) => creds,
            Err(_) => {
                let Some(username) = self.prompt("Username: ").await else {
                    return Ok(());
                };
                let Some(password) = self.prompt("Password: ").await else {
                    return Ok(());
                };
                (username, password)
            }
        };
        self.session.login(&username, &password).await?;
        println!("Logged in as {username}");
        Ok(())
    }

    async fn load_story(&mut self) -> Result<(), SessionError> {
        let Some(id) = self.prompt("Enter story id: ").await else {
            return Ok(());
        };
        let Ok(item_id) = id.parse::<u32>() else {
            println!("Invalid story id");
            return Ok(());
        };
        println!("Downloading story info...");
        let story = self.session.load_skeleton(item_id).await?;
        println!("{story}");
        Ok(())
    }

    fn story_info(&self) -> Result<(), SessionError> {
        let story = self.session.story().ok_or(SessionError::NoStory)?;
        println!("{story}");
        if !story.info_text.is_empty() {
            println!("{}", story.info_text);
        }
        Ok(())
    }

    /// Walk the tree interactively: show a chapter and its choices, then
    /// descend by choice number, go up with `u`, or leave with `q`.
    async fn explore(&mut self) -> Result<(), SessionError> {
        let mut current: Option<NodeIndex> = None;
        loop {
            let story = self.session.story().ok_or(SessionError::NoStory)?;
            match current {
                None => {
                    println!("Story beginnings:");
                    for (slot, index) in story.root_chapters() {
                        let title = &story.nodes.get(index)?.title;
                        println!("  {}) {title}", slot + 1);
                    }
                }
                Some(index) => print_chapter(story, index)?,
            }

            let Some(choice) = self.prompt("Choice (u = up, q = back to menu): ").await else {
                return Ok(());
            };
            match choice.as_str() {
                "q" | "Q" => return Ok(()),
                "u" | "U" => {
                    let story = self.session.story().ok_or(SessionError::NoStory)?;
                    current = match current {
                        Some(index) => story.nodes.get(index)?.parent,
                        None => None,
                    };
                }
                _ => {
                    let Ok(number) = choice.parse::<u8>() else {
                        println!("Invalid input");
                        continue;
                    };
                    let Some(slot) = number.checked_sub(1) else {
                        println!("Invalid input");
                        continue;
                    };
                    let story = self.session.story().ok_or(SessionError::NoStory)?;
                    let next = match current {
                        None => story.root_slot(slot),
                        Some(index) => story.nodes.get(index)?.child(slot),
                    };
                    match next {
                        Some(index) => current = Some(index),
                        None => println!("No chapter at that choice"),
                    }
                }
            }
        }
    }

    async fn download(&mut self, kind: DownloadKind) -> Result<(), SessionError> {
        let story = self.session.story().ok_or(SessionError::NoStory)?;
        let targets = match kind {
            DownloadKind::All => story.all_nodes(),
            DownloadKind::Branch | DownloadKind::One => {
                let Some(path) = self
                    .prompt("Chapter path (e.g. 1-2-1): ")
                    .await
                    .filter(|p| !p.is_empty())
                else {
                    return Ok(());
                };
                let story = self.session.story().ok_or(SessionError::NoStory)?;
                let Some(index) = resolve_path(story, &path) else {
                    println!("No chapter at {path}");
                    return Ok(());
                };
                match kind {
                    DownloadKind::Branch => story.subtree_nodes(index)?,
                    _ => vec![index],
                }
            }
        };

        let force = matches!(kind, DownloadKind::One);
        let options = DownloadOptions {
            force,
            ..DownloadOptions::default()
        };
        let cancel = CancellationToken::new();
        let progress = DownloadProgress::new();

        let download =
            self.session
                .download(&targets, options, cancel.clone(), progress.clone());
        tokio::pin!(download);
        let mut ticker = tokio::time::interval(Duration::from_millis(500));

        let report = loop {
            tokio::select! {
                result = &mut download => break result?,
                _ = ticker.tick() => render_progress(&progress),
                _ = tokio::signal::ctrl_c() => {
                    cancel.cancel();
                    println!("\nCancelling - finishing the current chapter...");
                }
            }
        };
        println!("\n{}", report.summary());
        Ok(())
    }

    async fn save(&mut self) -> Result<(), SessionError> {
        let Some(path) = self.prompt("Save to file: ").await.filter(|p| !p.is_empty()) else {
            return Ok(());
        };
        self.session.save(&path).await?;
        println!("Saved to {path}");
        Ok(())
    }

    async fn open(&mut self) -> Result<(), SessionError> {
        let Some(path) = self.prompt("Open file: ").await.filter(|p| !p.is_empty()) else {
            return Ok(());
        };
        let story = self.session.load(&path).await?;
        println!("{story}");
        Ok(())
    }

    async fn export_json(&mut self) -> Result<(), SessionError> {
        let Some(path) = self.prompt("Export to file: ").await.filter(|p| !p.is_empty())
        else {
            return Ok(());
        };
        self.session.export_json(&path).await?;
        println!("Exported to {path}");
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
enum DownloadKind {
    All,
    Branch,
    One,
}

fn print_chapter(story: &Story, index: NodeIndex) -> Result<(), SessionError> {
    let chapter = story.nodes.get(index)?;
    println!("== {} ==", chapter.title);
    if !chapter.author.is_empty() {
        println!("by {}", chapter.author);
    }
    if chapter.is_downloaded() {
        println!("{}", chapter.text);
    } else {
        println!("(not downloaded yet)");
    }
    for (slot, _) in chapter.used_choices() {
        let label = story.choice_label(index, slot).unwrap_or_default();
        println!("  {}) {label}", slot + 1);
    }
    Ok(())
}

/// Resolve a 1-based dashed path like `1-2-1` to a chapter index.
fn resolve_path(story: &Story, path: &str) -> Option<NodeIndex> {
    let mut slots = path.split('-').map(|seg| {
        seg.trim()
            .parse::<u8>()
            .ok()
            .and_then(|n| n.checked_sub(1))
    });
    let mut current = story.root_slot(slots.next()??)?;
    for slot in slots {
        current = story.nodes.get(current).ok()?.child(slot?)?;
    }
    Some(current)
}

fn render_progress(progress: &DownloadProgress) {
    let total = progress.total();
    if total == 0 {
        return;
    }
    let retries = progress.retries();
    let retry_note = if retries > 0 {
        format!(" (busy, retry {retries})")
    } else {
        String::new()
    };
    print!(
        "\rDownloading chapter {}/{}{retry_note}...    ",
        (progress.completed() + 1).min(total),
        total
    );
    let _ = std::io::stdout().flush();
}
