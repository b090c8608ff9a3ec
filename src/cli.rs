use clap::{Parser, Subcommand, ValueEnum};
use rx_core::ToolKind;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "rsext")]
#[command(author, version, about = "Media toolbox: track extraction, merging and versioned results")]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Extract tracks from one or more media files
    Extract {
        /// Files to extract from
        #[arg(required = true)]
        inputs: Vec<PathBuf>,

        /// Container stream indices to extract (default: all audio and subtitles)
        #[arg(short, long, value_delimiter = ',')]
        streams: Vec<u32>,

        /// Also extract video streams when no indices are given
        #[arg(long)]
        include_video: bool,

        /// Directory for extracted files (default: next to each input)
        #[arg(short, long)]
        output_dir: Option<PathBuf>,

        /// Files processed at once (overrides config)
        #[arg(short, long)]
        jobs: Option<usize>,
    },

    /// Add external tracks to a video
    Merge {
        /// Source video
        #[arg(required = true)]
        video: PathBuf,

        /// Track to attach as PATH[:LANG[:DELAY_MS]]
        #[arg(short, long = "track", required = true)]
        tracks: Vec<String>,

        /// Output file (default: <stem>.merged.mkv next to the video)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Probe a media file and display information
    Probe {
        /// File to probe
        #[arg(required = true)]
        file: PathBuf,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Check that required external tools are available
    CheckTools,

    /// List the saved result versions of a file
    Versions {
        /// Source file whose sidecar to read
        #[arg(required = true)]
        file: PathBuf,

        /// Only show one tool
        #[arg(short, long, value_enum)]
        tool: Option<ToolArg>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Write the active OCR result of a file as a subtitle file
    ExportOcr {
        /// Source video whose sidecar holds the OCR result
        #[arg(required = true)]
        file: PathBuf,

        /// Subtitle file to write
        #[arg(short, long)]
        output: PathBuf,

        /// srt, vtt or txt (default: the output extension, else srt)
        #[arg(short, long)]
        format: Option<String>,
    },

    /// Validate configuration file
    Validate {
        /// Config file to validate (uses default if not specified)
        config: Option<PathBuf>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ToolArg {
    Extraction,
    Merge,
    Transcription,
    Ocr,
    Translation,
}

impl From<ToolArg> for ToolKind {
    fn from(arg: ToolArg) -> Self {
        match arg {
            ToolArg::Extraction => ToolKind::Extraction,
            ToolArg::Merge => ToolKind::Merge,
            ToolArg::Transcription => ToolKind::Transcription,
            ToolArg::Ocr => ToolKind::Ocr,
            ToolArg::Translation => ToolKind::Translation,
        }
    }
}
