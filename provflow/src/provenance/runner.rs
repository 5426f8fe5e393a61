//! Executes a step behind the provenance gate.

use std::fmt;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;
use tracing::{debug, info};

use super::chain::PipelineChain;
use super::gate::{Decision, GateMode, Outcome, ProvenanceGate};
use super::header::write_chain_header;
use crate::errors::Result;
use crate::events::{Advisory, AdvisorySink, LoggingAdvisorySink};
use crate::observability::SpanTimer;

/// Writes an artifact (chain header, then body) to a temporary file next to
/// the target and moves it into place on [`ArtifactWriter::commit`].
///
/// Dropping the writer without committing removes the temporary file and
/// leaves the target untouched.
pub struct ArtifactWriter {
    target: PathBuf,
    inner: BufWriter<NamedTempFile>,
    header_len: u64,
    position: u64,
}

impl fmt::Debug for ArtifactWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArtifactWriter")
            .field("target", &self.target)
            .field("position", &self.position)
            .finish_non_exhaustive()
    }
}

impl ArtifactWriter {
    /// Starts an artifact at `target` carrying `chain`.
    pub fn create(target: impl Into<PathBuf>, chain: &PipelineChain) -> Result<Self> {
        let target = target.into();
        let dir = match target.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let mut inner = BufWriter::new(NamedTempFile::new_in(dir)?);
        let header_len = write_chain_header(&mut inner, chain)?;
        debug!(target = %target.display(), header_len, "Artifact started");

        Ok(Self {
            target,
            inner,
            header_len,
            position: header_len,
        })
    }

    /// Absolute offset of the next byte written.
    #[must_use]
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Size of the chain header.
    #[must_use]
    pub fn header_len(&self) -> u64 {
        self.header_len
    }

    /// The path the artifact lands at on commit.
    #[must_use]
    pub fn target(&self) -> &Path {
        &self.target
    }

    /// Flushes, syncs and moves the artifact into place. Returns its size.
    pub fn commit(self) -> Result<u64> {
        let file = self.inner.into_inner().map_err(io::IntoInnerError::into_error)?;
        file.as_file().sync_all()?;
        file.persist(&self.target).map_err(|e| e.error)?;
        info!(target = %self.target.display(), bytes = self.position, "Artifact committed");
        Ok(self.position)
    }
}

impl Write for ArtifactWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.inner.write(buf)?;
        self.position += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// What a guarded step did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepReport {
    /// The existing output was kept.
    Skipped {
        /// Output path.
        path: PathBuf,
        /// Advisories raised by the gate (version drift).
        advisories: Vec<Advisory>,
    },
    /// The step ran and wrote its output.
    Written {
        /// Output path.
        path: PathBuf,
        /// Whether an existing file was replaced.
        overwritten: bool,
        /// Final artifact size, when the runner wrote it.
        bytes: Option<u64>,
        /// Advisories raised by the gate.
        advisories: Vec<Advisory>,
    },
}

impl StepReport {
    /// Whether the step body ran.
    #[must_use]
    pub fn ran(&self) -> bool {
        matches!(self, Self::Written { .. })
    }

    /// The output path.
    #[must_use]
    pub fn path(&self) -> &Path {
        match self {
            Self::Skipped { path, .. } | Self::Written { path, .. } => path,
        }
    }
}

/// One step of a pipeline, guarded by its output's provenance.
///
/// ```rust,ignore
/// let report = GuardedStep::new("sorted.pvs", expected)
///     .with_mode(GateMode::OverwriteIfRequired)
///     .run(|out| write_body(out))?;
/// ```
#[derive(Clone)]
pub struct GuardedStep {
    output: PathBuf,
    expected: PipelineChain,
    mode: GateMode,
    sink: Arc<dyn AdvisorySink>,
}

impl fmt::Debug for GuardedStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GuardedStep")
            .field("output", &self.output)
            .field("steps", &self.expected.len())
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

impl GuardedStep {
    /// Guards `output`, which this invocation would produce with `expected`.
    #[must_use]
    pub fn new(output: impl Into<PathBuf>, expected: PipelineChain) -> Self {
        Self {
            output: output.into(),
            expected,
            mode: GateMode::Default,
            sink: Arc::new(LoggingAdvisorySink),
        }
    }

    /// Sets the gate mode.
    #[must_use]
    pub fn with_mode(mut self, mode: GateMode) -> Self {
        self.mode = mode;
        self
    }

    /// Sets the advisory sink.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn AdvisorySink>) -> Self {
        self.sink = sink;
        self
    }

    /// The chain the output will carry.
    #[must_use]
    pub fn expected(&self) -> &PipelineChain {
        &self.expected
    }

    /// Asks the gate without running anything.
    pub fn decide(&self) -> Decision {
        ProvenanceGate::for_output(&self.output)
            .with_sink(self.sink.clone())
            .evaluate(&self.expected, self.mode)
    }

    /// Runs `body` against an [`ArtifactWriter`] if the gate allows it,
    /// committing on success.
    pub fn run<F>(&self, body: F) -> Result<StepReport>
    where
        F: FnOnce(&mut ArtifactWriter) -> Result<()>,
    {
        self.run_with(|path, chain| {
            let mut writer = ArtifactWriter::create(path, chain)?;
            body(&mut writer)?;
            writer.commit().map(Some)
        })
    }

    /// Runs `body` with the output path and chain if the gate allows it.
    ///
    /// For writers that manage their own artifact file, such as the
    /// container writer. `body` returns the artifact size if it knows it.
    pub fn run_with<F>(&self, body: F) -> Result<StepReport>
    where
        F: FnOnce(&Path, &PipelineChain) -> Result<Option<u64>>,
    {
        let step = self.expected.last_step()?;
        let timer = SpanTimer::start(format!("step:{}", step.action_name));
        let Decision { outcome, advisories, .. } = self.decide();

        let overwritten = match outcome {
            Outcome::Skip => {
                info!(output = %self.output.display(), "Existing output reused");
                return Ok(StepReport::Skipped {
                    path: self.output.clone(),
                    advisories,
                });
            }
            Outcome::Fail(failure) => return Err(failure.into_error()),
            Outcome::Proceed => false,
            Outcome::ProceedOverwrite => true,
        };

        let bytes = body(&self.output, &self.expected)?;
        let elapsed_ms = timer.finish();
        info!(
            output = %self.output.display(),
            action = %step.action_name,
            overwritten,
            elapsed_ms,
            "Step completed"
        );

        Ok(StepReport::Written {
            path: self.output.clone(),
            overwritten,
            bytes,
            advisories,
        })
    }
}
