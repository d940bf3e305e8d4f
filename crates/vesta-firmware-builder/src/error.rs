use std::fmt;
use std::path::PathBuf;

#[derive(Debug)]
pub enum Error {
    /// Bad build definition: unsupported toolchain or architecture, malformed
    /// hex values, missing required sections. Raised before any subprocess runs.
    Config(String),
    /// A region-patch source artifact does not fit its declared region.
    OversizeSource {
        source: PathBuf,
        source_len: u64,
        region_size: u64,
    },
    /// An external tool (build, VCS, media tool, emulator) failed to spawn or
    /// exited nonzero. Carries the child's exit code when the OS reported one.
    Tool { what: String, code: Option<i32> },
    /// Reverting the patched secondary source tree failed. An un-reverted tree
    /// corrupts every later run, so this is reported in place of whatever the
    /// wrapped build returned.
    Revert { repo: PathBuf, detail: String },
    /// One or more non-exempt tests failed.
    TestFailure { failed: usize },
    Msg(String),
}

impl Error {
    pub fn msg<M: Into<String>>(msg: M) -> Self {
        Self::Msg(msg.into())
    }

    pub fn config<M: Into<String>>(msg: M) -> Self {
        Self::Config(msg.into())
    }

    pub fn tool<M: Into<String>>(what: M, code: Option<i32>) -> Self {
        Self::Tool {
            what: what.into(),
            code,
        }
    }

    /// Process exit status for the pipeline driver: the first failing
    /// subprocess's exit code where available, 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Tool { code: Some(c), .. } if *c != 0 => *c,
            _ => 1,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Config(msg) => write!(f, "configuration error: {msg}"),
            Error::OversizeSource {
                source,
                source_len,
                region_size,
            } => write!(
                f,
                "source file {} is larger than the target region ({} > {} bytes)",
                source.display(),
                source_len,
                region_size
            ),
            Error::Tool { what, code } => match code {
                Some(c) => write!(f, "{what} (exit code {c})"),
                None => write!(f, "{what}"),
            },
            Error::Revert { repo, detail } => write!(
                f,
                "failed to revert {} to its base revision; the tree is left patched and must be restored before the next run: {detail}",
                repo.display()
            ),
            Error::TestFailure { failed } => {
                write!(f, "{failed} non-exempt test(s) failed")
            }
            Error::Msg(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::msg(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::msg(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
