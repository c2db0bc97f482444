use std::io;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::control::ControlPlane;
use crate::error::ExecError;
use crate::executor::{self, Completion, StatusByte};
use crate::identity::{Identity, IdentityAllocator};
use crate::instruction::{self, DecodeError, Instruction, InstructionKind};
use crate::pipes::{PipeResolver, StdioEndpoints};
use crate::runner::RunnerSpec;
use crate::transport::mailbox::Mailbox;
use crate::transport::reporter::ResultReporter;

/// Why the daemon loop stopped without a fatal error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stop {
    /// The instruction source has no more records
    EndOfStream,
    Shutdown,
    Abort,
}

/// The instruction loop at the core of the executor.
///
/// Takes one record at a time, runs it to completion and reports its
/// status byte before looking at the next record. Abort and shutdown are
/// raced at every wait.
pub struct Daemon {
    identities: IdentityAllocator,
    runner: RunnerSpec,
    pipes: PipeResolver,
    reporter: Box<dyn ResultReporter>,
    control: ControlPlane,
}

impl Daemon {
    pub fn new(
        identities: IdentityAllocator,
        runner: RunnerSpec,
        pipes: PipeResolver,
        reporter: Box<dyn ResultReporter>,
        control: ControlPlane,
    ) -> Self {
        Self {
            identities,
            runner,
            pipes,
            reporter,
            control,
        }
    }

    /// The uid/gid pair exec instructions currently run as.
    pub fn identity(&self) -> Identity {
        self.identities.current()
    }

    /// Main loop
    pub async fn run(
        &mut self,
        mut records: mpsc::Receiver<io::Result<Vec<u8>>>,
    ) -> Result<Stop, ExecError> {
        info!("Executor started, waiting for instructions...");

        loop {
            let record = tokio::select! {
                biased;
                _ = self.control.abort.fired() => return Ok(Stop::Abort),
                _ = self.control.shutdown.fired() => return Ok(Stop::Shutdown),
                record = records.recv() => record,
            };
            let record = match record {
                Some(Ok(record)) => record,
                Some(Err(e)) => return Err(ExecError::Source(e)),
                None => return Ok(Stop::EndOfStream),
            };

            let instruction = match instruction::decode(&record) {
                Ok(instruction) => instruction,
                Err(DecodeError::Blank) => continue,
                Err(e) => {
                    warn!(
                        "Skipping instruction {}: {e}",
                        String::from_utf8_lossy(&record).trim_end()
                    );
                    continue;
                }
            };

            // Every handle of this instruction is closed once process() returns.
            let status = match self.process(&instruction).await? {
                Some(status) => status,
                None => return Ok(Stop::Abort),
            };

            match records.try_recv() {
                Ok(Ok(early)) => return Err(ExecError::ProtocolViolation(early.len())),
                Ok(Err(e)) => return Err(ExecError::Source(e)),
                Err(_) => {}
            }

            // The exit-code relay blocks until the caller reads it
            tokio::select! {
                biased;
                _ = self.control.abort.fired() => return Ok(Stop::Abort),
                reported = self.reporter.report(status) => reported.map_err(ExecError::Report)?,
            }
            debug!("Reported status {}", status.as_byte());
        }
    }

    /// Runs one instruction. `None` means the abort signal preempted it.
    async fn process(&mut self, instruction: &Instruction) -> Result<Option<StatusByte>, ExecError> {
        match instruction.kind() {
            InstructionKind::CreateUser => self.create_user(instruction).await,
            InstructionKind::Execute => {
                let argv = self.runner.build(instruction)?;
                let Some(stdio) = self.open_stdio(instruction).await? else {
                    return Ok(None);
                };
                let identity = self.identities.current();
                match executor::execute(&argv, identity, stdio, &mut self.control.abort).await {
                    Completion::Finished(status) => Ok(Some(status)),
                    Completion::Aborted => Ok(None),
                }
            }
        }
    }

    async fn create_user(&mut self, instruction: &Instruction) -> Result<Option<StatusByte>, ExecError> {
        if !instruction.command.is_empty() {
            warn!(
                "Command {:?} ignored because we are creating a new user",
                instruction.command
            );
        }
        let Some(mut stdio) = self.open_stdio(instruction).await? else {
            return Ok(None);
        };

        match self.identities.allocate() {
            Ok(identity) => {
                if let Err(e) = stdio.write_stdout_line(&identity.uid.to_string()) {
                    warn!("Failed to hand uid {} to the caller: {e}", identity.uid);
                }
                info!("Switched to uid={} gid={}", identity.uid, identity.gid);
                Ok(Some(StatusByte::Success))
            }
            Err(e) => {
                if let Err(write_err) = stdio.write_stdout_line("-1") {
                    warn!("Failed to report exhaustion to the caller: {write_err}");
                }
                Err(e)
            }
        }
    }

    async fn open_stdio(
        &mut self,
        instruction: &Instruction,
    ) -> Result<Option<StdioEndpoints>, ExecError> {
        tokio::select! {
            biased;
            _ = self.control.abort.fired() => Ok(None),
            opened = self.pipes.open(instruction) => opened.map(Some),
        }
    }
}

/// Maps a clean stop to the process exit code. An abort also removes the
/// mailbox nodes, if the transport created any.
pub fn conclude(stop: Stop, mailbox: Option<&Mailbox>, abort_exit_code: i32) -> i32 {
    match stop {
        Stop::EndOfStream => {
            info!("Instruction stream closed, exiting");
            0
        }
        Stop::Shutdown => {
            info!("Shutdown signal received, exiting");
            0
        }
        Stop::Abort => {
            warn!("Abort signal received, tearing down");
            if let Some(mailbox) = mailbox {
                mailbox.teardown();
            }
            abort_exit_code
        }
    }
}
