use clap::{Parser, Subcommand};

/// Archive and migrate IMAP mailboxes with Git-trackable local state.
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Pull emails from IMAP into local storage
    Pull {
        /// Account name from .eml/config.yaml
        account: String,
        /// Source folder (defaults to the account type's usual folder)
        #[arg(short, long)]
        folder: Option<String>,
        /// Ignore pull records, check every UID the server lists
        #[arg(short = 'F', long)]
        full: bool,
        /// Only attempt the UIDs in the failure log
        #[arg(short, long)]
        retry: bool,
        /// Max emails to fetch
        #[arg(short, long)]
        limit: Option<usize>,
        /// Show what would be fetched without writing anything
        #[arg(short = 'n', long)]
        dry_run: bool,
        /// UID cache TTL in minutes (0 = always refresh)
        #[arg(short = 'T', long, default_value_t = 60)]
        cache_ttl: i64,
        /// Abort after N consecutive errors (rate limit detection)
        #[arg(short = 'e', long, default_value_t = 10)]
        max_errors: usize,
        /// Save run progress every N messages
        #[arg(short = 'b', long = "batch", default_value_t = 100)]
        checkpoint: usize,
        /// Tag stored messages (sqlite layout only)
        #[arg(short, long)]
        tag: Option<String>,
        /// Only messages to/from/cc this address (repeatable)
        #[arg(short = 'a', long = "address")]
        addresses: Vec<String>,
        /// Only messages to/from/cc this domain (repeatable)
        #[arg(short = 'd', long = "domain")]
        domains: Vec<String>,
        /// Only messages from this address (repeatable)
        #[arg(long = "from-address")]
        from_addresses: Vec<String>,
        /// Only messages from this domain (repeatable)
        #[arg(long = "from-domain")]
        from_domains: Vec<String>,
        /// IMAP username (overrides account)
        #[arg(short, long)]
        user: Option<String>,
        /// IMAP password (overrides account)
        #[arg(short, long)]
        password: Option<String>,
    },

    /// Push emails from local storage to an IMAP destination
    Push {
        /// Destination account name
        account: String,
        /// Destination folder
        #[arg(short, long, default_value = "INBOX")]
        folder: String,
        /// Max emails to push
        #[arg(short, long)]
        limit: Option<usize>,
        /// Show what would be pushed
        #[arg(short = 'n', long)]
        dry_run: bool,
        /// Skip messages larger than N MiB
        #[arg(short = 'S', long, default_value_t = 25)]
        max_size: u64,
        /// Delay between messages in seconds
        #[arg(short, long, default_value_t = 0.0)]
        delay: f64,
        /// Abort after N consecutive errors
        #[arg(short = 'e', long, default_value_t = 10)]
        max_errors: usize,
        /// Only push messages carrying this tag (sqlite layout only)
        #[arg(short, long)]
        tag: Option<String>,
        /// IMAP username (overrides account)
        #[arg(short, long)]
        user: Option<String>,
        /// IMAP password (overrides account)
        #[arg(short, long)]
        password: Option<String>,
    },

    /// List folders on the server
    Folders {
        account: String,
        /// Fetch per-folder message counts (slower)
        #[arg(long)]
        counts: bool,
    },

    /// Compare server UIDs against local pull records
    Uids {
        account: String,
        /// Folder to inspect (defaults to the account type's usual folder)
        #[arg(short, long)]
        folder: Option<String>,
        /// Refresh the server UID cache before comparing
        #[arg(short, long)]
        refresh: bool,
        /// Fetch Message-IDs for cached UIDs that lack one
        #[arg(short = 'm', long)]
        fetch_missing_ids: bool,
    },

    /// Rebuild or update the file index
    Index {
        /// Incremental update from git changes instead of a full rebuild
        #[arg(short, long)]
        update: bool,
        /// Show index statistics only
        #[arg(short, long)]
        stats: bool,
    },

    /// Build or update the full-text search index
    IndexFts {
        /// Number of parallel file readers
        #[arg(short, long, default_value_t = 8)]
        jobs: usize,
        /// Limit number of messages to process
        #[arg(short, long)]
        limit: Option<i64>,
        /// Rebuild the FTS index from scratch (metadata only)
        #[arg(short = 'R', long)]
        rebuild: bool,
    },

    /// Full-text search over pulled messages
    Search {
        /// FTS5 query (supports AND, OR, NOT, "phrases")
        query: String,
        #[arg(short, long, default_value_t = 50)]
        limit: i64,
        #[arg(short, long, default_value_t = 0)]
        offset: i64,
        #[arg(short, long)]
        account: Option<String>,
        #[arg(short, long)]
        folder: Option<String>,
    },

    /// Show the thread containing a Message-ID
    Thread {
        message_id: String,
        /// Direct replies only
        #[arg(long)]
        replies: bool,
    },

    /// Export pulled UIDs to the Git-portable parquet projection
    Export,

    /// Rebuild the UID DB from the parquet projection
    Import,

    /// Convert the store to a different layout
    Convert {
        /// Target layout: preset name, template string, or "sqlite"
        layout: String,
        /// Enumerate moves without writing
        #[arg(short = 'n', long)]
        dry_run: bool,
    },

    /// Show sync status and recent activity
    Status,
}
