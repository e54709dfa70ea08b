//! Command-line argument parsing.
//!
//! Defines the CLI structure using clap derive macros.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Dossier: document intelligence engine.
///
/// Ingests parsed PDFs into a hybrid retrieval index and runs LLM-backed
/// extraction, workflow synthesis, and RAG chat over them.
#[derive(Parser, Debug)]
#[command(name = "dossier")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Data directory (database and artifact store).
    ///
    /// Defaults to the platform data directory.
    #[arg(short, long, env = "DOSSIER_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format (text, json).
    #[arg(long, default_value = "text", global = true)]
    pub format: String,

    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Initialize the engine database.
    ///
    /// Creates the database file and schema if they don't exist.
    Init {
        /// Force re-initialization (destroys existing data).
        #[arg(short, long)]
        force: bool,
    },

    /// Show engine status (documents, chunks, runs).
    Status,

    /// Ingest a document: parse, chunk, and embed it for retrieval.
    Ingest {
        /// Path to the document file.
        file: PathBuf,

        /// Owning user id.
        #[arg(long, default_value = "local")]
        user: String,

        /// Owning organization id.
        #[arg(long, default_value = "local")]
        org: String,

        /// Parser to use (plain, azure, pymupdf, llmwhisperer).
        #[arg(short, long, default_value = "plain")]
        parser: String,

        /// Wait for the pipeline to finish, streaming progress.
        #[arg(short, long)]
        wait: bool,
    },

    /// List ingested documents.
    #[command(name = "list", alias = "ls")]
    ListDocuments {
        /// Organization to list.
        #[arg(long, default_value = "local")]
        org: String,
    },

    /// Run a one-shot structured extraction over a document.
    Extract {
        /// Path to the document file.
        file: PathBuf,

        /// Owning user id.
        #[arg(long, default_value = "local")]
        user: String,

        /// Owning organization id.
        #[arg(long, default_value = "local")]
        org: String,

        /// Optional context hint guiding the extraction.
        #[arg(short, long)]
        context: Option<String>,

        /// Parser to use (plain, azure, pymupdf, llmwhisperer).
        #[arg(short, long, default_value = "plain")]
        parser: String,
    },

    /// Retry a failed extraction from its last completed stage.
    Retry {
        /// Extraction id.
        extraction_id: String,
    },

    /// Run a workflow template over ingested documents.
    Workflow {
        /// Template name (e.g. "Investment Memo").
        #[arg(short, long, default_value = "Investment Memo")]
        template: String,

        /// Document ids to run over (repeatable).
        #[arg(short, long, required = true)]
        document: Vec<String>,

        /// Template variables as a JSON object.
        #[arg(long, default_value = "{}")]
        variables: String,

        /// Custom user objective appended to the prompt.
        #[arg(long)]
        prompt: Option<String>,
    },

    /// Search ingested chunks with hybrid retrieval.
    Search {
        /// Query text.
        query: String,

        /// Restrict to a document id.
        #[arg(short, long)]
        document: Option<String>,

        /// Maximum results.
        #[arg(short = 'k', long, default_value = "10")]
        top_k: usize,
    },

    /// Chat with a document set (streams the answer).
    Chat {
        /// The question.
        message: String,

        /// Session id (created when omitted).
        #[arg(short, long)]
        session: Option<String>,

        /// Documents to attach to a new session (repeatable).
        #[arg(short, long)]
        document: Vec<String>,
    },

    /// Stream progress events for a job.
    Watch {
        /// Job id.
        job_id: String,
    },
}

impl Cli {
    /// Returns the data directory, using the platform default if not set.
    #[must_use]
    pub fn resolve_data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("dossier")
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_parse() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_custom_data_dir() {
        let cli = Cli {
            data_dir: Some(PathBuf::from("/custom/dir")),
            verbose: false,
            format: "text".to_string(),
            command: Commands::Status,
        };
        assert_eq!(cli.resolve_data_dir(), PathBuf::from("/custom/dir"));
    }

    #[test]
    fn test_workflow_args() {
        let cli = Cli::parse_from([
            "dossier",
            "workflow",
            "--template",
            "Investment Memo",
            "--document",
            "d1",
            "--document",
            "d2",
        ]);
        match cli.command {
            Commands::Workflow { template, document, .. } => {
                assert_eq!(template, "Investment Memo");
                assert_eq!(document, vec!["d1", "d2"]);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
