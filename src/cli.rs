use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum CollectionArgs {
    /// List collections
    List {},
    /// Create a new collection
    Create {
        name: String,

        #[clap(short, long)]
        description: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Find photos of people who look like the reference photos.
    Search {
        /// Photo of a person to look for. Repeat for more.
        #[clap(short, long = "positive", required = true)]
        positives: Vec<PathBuf>,

        /// Photo of a person to steer away from. Repeat for more.
        #[clap(short, long = "negative")]
        negatives: Vec<PathBuf>,

        /// Wait for the backend to come up before searching
        #[clap(short, long, default_value = "false")]
        wait: bool,
    },
    /// Search a collection by description
    Text {
        prompt: String,

        /// Collection id. Defaults to the first collection.
        #[clap(short, long)]
        collection: Option<String>,
    },
    /// Generate an image from a description and search with it
    Generate {
        prompt: String,

        /// Collection id. Defaults to the first collection.
        #[clap(short, long)]
        collection: Option<String>,
    },
    /// Print the last search result
    Show {},
    /// Forget the last search result
    Reset {
        /// Auto confirm
        #[clap(short, long, default_value = "false")]
        yes: bool,
    },
    /// List past searches
    History {},
    /// Manage collections
    Collections {
        #[clap(subcommand)]
        action: CollectionArgs,
    },
    /// Block until the search api responds
    Wait {},
}
