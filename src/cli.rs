use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::entities::EntityKind;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the HTTP service and the refresh queue.
    Daemon {},

    /// Recompute the embedding of a single profile or item.
    Refresh {
        #[clap(value_enum)]
        kind: EntityKind,

        /// Entity id
        id: String,
    },

    /// Recompute the embeddings of every profile and item.
    RefreshAll {
        /// Auto confirm
        #[clap(short, long, default_value = "false")]
        yes: bool,
    },

    /// Recompute embeddings of recently updated profiles and items.
    Batch {
        /// Only entities updated at or after this time
        /// (RFC 3339, `YYYY-MM-DDTHH:MM:SS` or `YYYY-MM-DD`)
        #[clap(short, long)]
        since: Option<String>,

        /// Maximum number of entities per kind
        #[clap(short, long)]
        limit: Option<usize>,
    },

    /// Recompute embeddings older than `max_snapshot_age_secs`.
    RefreshStale {
        #[clap(value_enum)]
        kind: EntityKind,
    },

    /// Recommend items for a profile.
    Recommend {
        profile_id: String,

        #[clap(short, long)]
        limit: Option<usize>,
    },

    /// Rank items against free text.
    Search {
        text: String,

        #[clap(short, long)]
        limit: Option<usize>,
    },

    /// Find profiles similar to a profile.
    Similar {
        profile_id: String,

        #[clap(short, long)]
        limit: Option<usize>,
    },

    /// Extract interests, preferences and requirements from free text.
    Analyze {
        text: String,
    },

    /// Load documents into a collection from a JSON file.
    ///
    /// The file holds an object mapping document ids to documents.
    /// Existing documents with the same id are replaced.
    Import {
        /// profiles, items, profileEmbeddings or itemEmbeddings
        collection: String,

        file: PathBuf,
    },
}
