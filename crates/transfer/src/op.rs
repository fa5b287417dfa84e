//! The per-file transfer state machine.
//!
//! A [`TransferOp`] is driven by the connection's dispatcher through four
//! entry points. [`on_send`](TransferOp::on_send) advances the op as far as
//! it can without outside input; the other three feed it a command reply, the
//! outcome of a nested operation, or the answer to an overwrite question.
//! Every entry point returns an [`OpResult`]: `Continue` asks for another
//! `on_send`, `WouldBlock` waits for input, anything else ends the op.

use std::path::{Path, PathBuf};

use bulkferry_aio::{AioError, EventSender, Reader, ReaderFactory, Writer, WriterFactory};
use bulkferry_data_channel::SharedIoEndpoint;
use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::Direction;
use crate::backend::{Backend, MetadataProbe};
use crate::capabilities::{Capability, CapabilityStore, Tri};
use crate::collaborators::{
    DirectoryCache, LookupFlags, OverwriteCheck, OverwriteDecision, OverwritePolicy,
    OverwriteQuery, ProtocolSession, TransferMode, TransferStart,
};
use crate::options::TransferOptions;
use crate::probe::{ProbeDecision, evaluate_resume_probe};
use crate::reply::{OpResult, ServerReply, SubcommandOutcome, TransferEndReason};
use crate::request::TransferRequest;
use crate::server::ServerKey;
use crate::timestamps::{local_mtime, set_local_mtime};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpState {
    Init,
    WaitCwd,
    WaitList,
    FetchSize,
    FetchTime,
    CheckOverwrite,
    WaitOverwrite,
    ResumeTest,
    WaitResumeTest,
    Transfer,
    WaitTransfer,
    SetTime,
    Done,
}

/// Coarse progress of an op, independent of the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    Init,
    Resolve,
    ExistenceCheck,
    CapabilityProbe,
    Transfer,
    Finalize,
    Done,
}

impl OpState {
    pub fn phase(self) -> Phase {
        match self {
            OpState::Init => Phase::Init,
            OpState::WaitCwd | OpState::WaitList | OpState::FetchSize | OpState::FetchTime => {
                Phase::Resolve
            }
            OpState::CheckOverwrite | OpState::WaitOverwrite => Phase::ExistenceCheck,
            OpState::ResumeTest | OpState::WaitResumeTest => Phase::CapabilityProbe,
            OpState::Transfer | OpState::WaitTransfer => Phase::Transfer,
            OpState::SetTime => Phase::Finalize,
            OpState::Done => Phase::Done,
        }
    }
}

/// How a successful op ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Transferred,
    Skipped,
    /// The target already matched the source; no data was moved.
    AlreadyComplete,
}

/// The local side of a running transfer.
#[derive(Debug)]
pub enum TransferIo {
    Reader(Reader),
    Writer(Writer),
    /// Served to a worker process through shared memory.
    Worker(SharedIoEndpoint),
}

impl TransferIo {
    pub fn close(&mut self) {
        match self {
            TransferIo::Reader(r) => r.close(),
            TransferIo::Writer(w) => w.close(),
            TransferIo::Worker(e) => e.close(),
        }
    }
}

/// Everything an op borrows from its connection while it runs.
pub struct TransferContext<'a> {
    pub session: &'a mut dyn ProtocolSession,
    pub cache: &'a dyn DirectoryCache,
    pub capabilities: &'a mut CapabilityStore,
    pub overwrite: &'a mut dyn OverwritePolicy,
    pub options: &'a TransferOptions,
    /// Where opened readers and writers post their ready events.
    pub events: &'a EventSender,
}

impl TransferContext<'_> {
    fn backend(&self) -> Backend {
        self.session.server().backend()
    }

    fn server_key(&self) -> ServerKey {
        self.session.server().key.clone()
    }

    fn timezone_offset(&self) -> i32 {
        self.session.server().timezone_offset
    }
}

#[derive(Debug)]
pub struct TransferOp {
    request: TransferRequest,
    state: OpState,
    awaiting_reply: bool,
    local_size: Option<u64>,
    local_exists: bool,
    remote_size: Option<u64>,
    remote_time: Option<DateTime<Utc>>,
    /// `Some(false)` only when a listing or reply confirmed absence.
    remote_exists: Option<bool>,
    listed: bool,
    try_absolute_path: bool,
    pending_probe: Option<u64>,
    set_time: Option<DateTime<Utc>>,
    outcome: Option<Outcome>,
    io: Option<TransferIo>,
}

impl TransferOp {
    pub fn new(request: TransferRequest) -> Self {
        Self {
            request,
            state: OpState::Init,
            awaiting_reply: false,
            local_size: None,
            local_exists: false,
            remote_size: None,
            remote_time: None,
            remote_exists: None,
            listed: false,
            try_absolute_path: false,
            pending_probe: None,
            set_time: None,
            outcome: None,
            io: None,
        }
    }

    pub fn request(&self) -> &TransferRequest {
        &self.request
    }

    pub fn state(&self) -> OpState {
        self.state
    }

    pub fn phase(&self) -> Phase {
        self.state.phase()
    }

    /// Set once the op has ended with [`OpResult::Ok`].
    pub fn outcome(&self) -> Option<Outcome> {
        self.outcome
    }

    pub fn local_size(&self) -> Option<u64> {
        self.local_size
    }

    pub fn remote_size(&self) -> Option<u64> {
        self.remote_size
    }

    pub fn remote_time(&self) -> Option<DateTime<Utc>> {
        self.remote_time
    }

    /// Commands name the file by its full path because the cwd failed.
    pub fn try_absolute_path(&self) -> bool {
        self.try_absolute_path
    }

    /// The reader, writer or worker endpoint while the data transfer runs.
    pub fn io_mut(&mut self) -> Option<&mut TransferIo> {
        self.io.as_mut()
    }

    pub fn on_send(&mut self, ctx: &mut TransferContext<'_>) -> OpResult {
        if self.awaiting_reply {
            return OpResult::WouldBlock;
        }
        match self.state {
            OpState::Init => self.init(ctx),
            OpState::FetchSize => self.send_size(ctx),
            OpState::FetchTime => self.send_time(ctx),
            OpState::CheckOverwrite => self.check_overwrite(ctx),
            OpState::ResumeTest => self.resume_test(ctx),
            OpState::Transfer => self.start_transfer(ctx),
            OpState::SetTime => self.send_set_time(ctx),
            OpState::WaitCwd
            | OpState::WaitList
            | OpState::WaitOverwrite
            | OpState::WaitResumeTest
            | OpState::WaitTransfer => OpResult::WouldBlock,
            OpState::Done => OpResult::InternalError,
        }
    }

    pub fn on_reply(&mut self, ctx: &mut TransferContext<'_>, reply: &ServerReply) -> OpResult {
        if !self.awaiting_reply {
            error!(state = ?self.state, line = %reply.line, "reply without a pending command");
            return OpResult::InternalError;
        }
        self.awaiting_reply = false;
        match self.state {
            OpState::FetchSize => self.size_reply(ctx, reply),
            OpState::FetchTime => self.time_reply(ctx, reply),
            OpState::SetTime => {
                if !reply.success {
                    debug!(line = %reply.line, "setting remote time failed");
                }
                self.finish(self.outcome.unwrap_or(Outcome::Transferred))
            }
            _ => OpResult::InternalError,
        }
    }

    pub fn on_subcommand_result(
        &mut self,
        ctx: &mut TransferContext<'_>,
        outcome: SubcommandOutcome,
    ) -> OpResult {
        match self.state {
            OpState::WaitCwd => {
                if outcome.result == OpResult::Ok {
                    self.resolve(ctx)
                } else {
                    debug!("cwd failed, using absolute paths");
                    self.try_absolute_path = true;
                    self.start_probe(ctx)
                }
            }
            OpState::WaitList => {
                self.listed = true;
                if outcome.result == OpResult::Ok {
                    self.resolve(ctx)
                } else {
                    self.start_probe(ctx)
                }
            }
            OpState::WaitResumeTest => self.resume_test_done(ctx, outcome),
            OpState::WaitTransfer => self.transfer_done(ctx, outcome),
            state => {
                error!(?state, "unexpected subcommand result");
                OpResult::InternalError
            }
        }
    }

    pub fn on_overwrite_decision(
        &mut self,
        ctx: &mut TransferContext<'_>,
        decision: OverwriteDecision,
    ) -> OpResult {
        if self.state != OpState::WaitOverwrite {
            error!(state = ?self.state, "overwrite decision without a pending question");
            return OpResult::InternalError;
        }
        self.apply_decision(ctx, decision)
    }

    fn init(&mut self, ctx: &mut TransferContext<'_>) -> OpResult {
        let backend = ctx.backend();
        let download = self.request.is_download();
        let Some(local) = self.request.local_path.clone() else {
            if download {
                error!("Download requested without a local file");
                return OpResult::SyntaxError;
            }
            error!("Upload requested without a local file");
            return OpResult::NotSupported;
        };

        if backend == Backend::ObjectStore && self.request.remote_path.is_root() {
            if download {
                error!("Cannot download from the root directory, select a bucket");
            } else {
                error!("You cannot upload files into the root directory.");
            }
            return OpResult::NotSupported;
        }
        if !download && !backend.supports_upload() {
            error!(backend = backend.scheme(), "Uploads are not supported");
            return OpResult::NotSupported;
        }

        if download {
            let remote = self.full_remote_name();
            info!(local = %local.display(), "Starting download of {remote}");
        } else {
            info!(remote = %self.full_remote_name(), "Starting upload of {}", local.display());
        }

        match std::fs::metadata(&local) {
            Ok(m) if m.is_file() => {
                self.local_size = Some(m.len());
                self.local_exists = true;
            }
            _ => {
                self.local_size = None;
                self.local_exists = false;
            }
        }

        if !backend.changes_directory() {
            return self.resolve(ctx);
        }
        if ctx.session.current_path() == Some(&self.request.remote_path) {
            return self.resolve(ctx);
        }
        self.state = OpState::WaitCwd;
        let r = ctx.session.change_directory(&self.request.remote_path);
        self.subcommand(ctx, r)
    }

    fn resolve(&mut self, ctx: &mut TransferContext<'_>) -> OpResult {
        let lookup = ctx.cache.lookup(
            &ctx.server_key(),
            &self.request.remote_path,
            &self.request.remote_file,
            LookupFlags {
                allow_outdated: self.listed,
            },
        );
        let Some(entry) = lookup.entry else {
            if !lookup.dir_exists {
                return self.refresh_or_probe(ctx);
            }
            debug!(file = %self.request.remote_file, "not in cached listing");
            self.remote_exists = Some(false);
            return self.fetch_time_or_check(ctx);
        };

        if entry.unsure {
            return self.refresh_or_probe(ctx);
        }
        if !lookup.matched_case {
            return self.start_probe(ctx);
        }

        self.remote_exists = Some(true);
        self.remote_size = entry.size;
        self.remote_time = entry.time.map(|t| t.time);
        if entry.time.is_some_and(|t| t.has_time_of_day()) {
            self.state = OpState::CheckOverwrite;
            return OpResult::Continue;
        }
        self.fetch_time_or_check(ctx)
    }

    fn refresh_or_probe(&mut self, ctx: &mut TransferContext<'_>) -> OpResult {
        if self.listed || !ctx.backend().lists_directories() {
            return self.start_probe(ctx);
        }
        self.listed = true;
        self.state = OpState::WaitList;
        let r = ctx.session.list(&self.request.remote_path, true);
        self.subcommand(ctx, r)
    }

    fn fetch_time_or_check(&mut self, ctx: &mut TransferContext<'_>) -> OpResult {
        let backend = ctx.backend();
        let wants_time = self.request.is_download()
            && ctx.options.preserve_timestamps
            && backend.can_fetch_time(&*ctx.capabilities, &ctx.server_key());
        self.state = if wants_time {
            OpState::FetchTime
        } else {
            OpState::CheckOverwrite
        };
        OpResult::Continue
    }

    fn start_probe(&mut self, ctx: &mut TransferContext<'_>) -> OpResult {
        self.state = match ctx.backend().metadata_probe() {
            MetadataProbe::Size => OpState::FetchSize,
            MetadataProbe::Time => OpState::FetchTime,
            MetadataProbe::None => OpState::CheckOverwrite,
        };
        OpResult::Continue
    }

    fn send_size(&mut self, ctx: &mut TransferContext<'_>) -> OpResult {
        let name = self.remote_name(ctx.backend());
        match ctx.backend().size_command(&name) {
            Some(cmd) => self.send(ctx, &cmd),
            None => {
                self.state = OpState::CheckOverwrite;
                OpResult::Continue
            }
        }
    }

    fn size_reply(&mut self, ctx: &mut TransferContext<'_>, reply: &ServerReply) -> OpResult {
        let key = ctx.server_key();
        if reply.success {
            if let Some(size) = ctx.backend().parse_size(&reply.line) {
                self.remote_size = Some(size);
                self.remote_exists = Some(true);
                ctx.capabilities
                    .set_if_unknown(&key, Capability::SizeCommand, Tri::Yes);
            }
        } else {
            let not_found = reports_missing_file(&reply.line, &self.remote_name(ctx.backend()));
            if not_found {
                self.remote_exists = Some(false);
            }
            // MDTM would fail the same way.
            if not_found || ctx.capabilities.get(&key, Capability::SizeCommand) == Tri::Yes {
                self.state = OpState::CheckOverwrite;
                return OpResult::Continue;
            }
        }

        self.state = if ctx.capabilities.get(&key, Capability::MdtmCommand) == Tri::No {
            OpState::CheckOverwrite
        } else {
            OpState::FetchTime
        };
        OpResult::Continue
    }

    fn send_time(&mut self, ctx: &mut TransferContext<'_>) -> OpResult {
        let name = self.remote_name(ctx.backend());
        match ctx.backend().time_command(&name) {
            Some(cmd) => self.send(ctx, &cmd),
            None => {
                self.state = OpState::CheckOverwrite;
                OpResult::Continue
            }
        }
    }

    fn time_reply(&mut self, ctx: &mut TransferContext<'_>, reply: &ServerReply) -> OpResult {
        let backend = ctx.backend();
        let parsed = if reply.success {
            backend.parse_time(&reply.line, ctx.timezone_offset())
        } else {
            None
        };
        if let Some(time) = parsed {
            self.remote_time = Some(time);
            self.remote_exists = Some(true);
            if backend == Backend::Ftp {
                ctx.capabilities
                    .set_if_unknown(&ctx.server_key(), Capability::MdtmCommand, Tri::Yes);
            }
        }
        self.state = OpState::CheckOverwrite;
        OpResult::Continue
    }

    fn check_overwrite(&mut self, ctx: &mut TransferContext<'_>) -> OpResult {
        let Some(local) = self.request.local_path.as_deref() else {
            return OpResult::InternalError;
        };
        let may_exist = match self.request.direction {
            Direction::Download => self.local_exists,
            Direction::Upload => self.remote_exists != Some(false),
        };
        if !may_exist || self.request.resume {
            return self.after_overwrite(ctx);
        }

        let query = OverwriteQuery {
            direction: self.request.direction,
            local_path: local,
            local_size: self.local_size,
            local_time: local_mtime(local),
            remote_path: &self.request.remote_path,
            remote_file: &self.request.remote_file,
            remote_size: self.remote_size,
            remote_time: self.remote_time,
        };
        match ctx.overwrite.check(&query) {
            OverwriteCheck::NoConflict => self.after_overwrite(ctx),
            OverwriteCheck::Decided(decision) => self.apply_decision(ctx, decision),
            OverwriteCheck::Pending => {
                self.state = OpState::WaitOverwrite;
                OpResult::WouldBlock
            }
        }
    }

    fn apply_decision(
        &mut self,
        ctx: &mut TransferContext<'_>,
        decision: OverwriteDecision,
    ) -> OpResult {
        debug!(?decision, "overwrite decision");
        match decision {
            OverwriteDecision::Overwrite => {
                self.request.resume = false;
                self.after_overwrite(ctx)
            }
            OverwriteDecision::Resume => {
                let supported = ctx.backend().supports_resume(self.request.direction);
                if !supported {
                    warn!("Resume is not supported here, overwriting instead");
                }
                self.request.resume = supported;
                self.after_overwrite(ctx)
            }
            OverwriteDecision::Rename(name) => {
                self.rename(name);
                OpResult::Continue
            }
            OverwriteDecision::Skip => {
                info!("Skipping {}", self.full_remote_name());
                self.finish(Outcome::Skipped)
            }
        }
    }

    /// Points the op at a new target and starts over.
    fn rename(&mut self, name: String) {
        match self.request.direction {
            Direction::Download => {
                let renamed = self
                    .request
                    .local_path
                    .as_deref()
                    .map(|p| p.with_file_name(&name))
                    .unwrap_or_else(|| PathBuf::from(&name));
                info!(to = %renamed.display(), "Renaming target");
                self.request.local_path = Some(renamed);
            }
            Direction::Upload => {
                info!(to = %name, "Renaming target");
                self.request.remote_file = name;
            }
        }
        self.local_size = None;
        self.local_exists = false;
        self.remote_size = None;
        self.remote_time = None;
        self.remote_exists = None;
        self.listed = false;
        self.try_absolute_path = false;
        self.state = OpState::Init;
    }

    fn after_overwrite(&mut self, ctx: &mut TransferContext<'_>) -> OpResult {
        let probe =
            self.request.resume && self.request.is_download() && ctx.backend().probes_resume();
        self.state = if probe {
            OpState::ResumeTest
        } else {
            OpState::Transfer
        };
        OpResult::Continue
    }

    fn resume_test(&mut self, ctx: &mut TransferContext<'_>) -> OpResult {
        let key = ctx.server_key();
        let boundaries = ctx.options.boundaries();
        let caps = &*ctx.capabilities;
        let decision = evaluate_resume_probe(
            self.local_size.unwrap_or(0),
            self.remote_size,
            &boundaries,
            |threshold| caps.get(&key, Capability::ResumeBug { threshold }),
        );

        match decision {
            ProbeDecision::Proceed => {
                self.state = OpState::Transfer;
                OpResult::Continue
            }
            ProbeDecision::Complete { boundary } => {
                info!(
                    "File sizes match and the server may not resume files > {} GiB, ending transfer",
                    gib(boundary)
                );
                self.complete_download(ctx, Outcome::AlreadyComplete)
            }
            ProbeDecision::Fail { boundary } => {
                error!(
                    "Server does not support resume of files > {} GiB",
                    gib(boundary)
                );
                OpResult::CriticalError
            }
            ProbeDecision::Probe { boundary } => {
                info!(
                    "Server may not support resume of files > {} GiB, testing",
                    gib(boundary)
                );
                let Some(local) = self.request.local_path.clone() else {
                    return OpResult::InternalError;
                };
                let backend = ctx.backend();
                let name = self.remote_name(backend);
                let start = TransferStart {
                    command: backend.transfer_command(Direction::Download, true, false, &name, &local),
                    mode: TransferMode::ResumeTest,
                    resume_offset: self.remote_size.unwrap_or(0).saturating_sub(1),
                    binary: true,
                };
                self.pending_probe = Some(boundary);
                self.state = OpState::WaitResumeTest;
                let r = ctx.session.start_transfer(start);
                self.subcommand(ctx, r)
            }
        }
    }

    fn resume_test_done(
        &mut self,
        ctx: &mut TransferContext<'_>,
        outcome: SubcommandOutcome,
    ) -> OpResult {
        let Some(boundary) = self.pending_probe.take() else {
            return OpResult::InternalError;
        };
        let key = ctx.server_key();
        if outcome.result == OpResult::Ok {
            for threshold in ctx.options.boundaries() {
                if threshold <= boundary {
                    ctx.capabilities
                        .set(&key, Capability::ResumeBug { threshold }, Tri::No);
                }
            }
            self.state = OpState::Transfer;
            return OpResult::Continue;
        }
        if outcome.end_reason == TransferEndReason::FailedResumeTest {
            ctx.capabilities.set(
                &key,
                Capability::ResumeBug {
                    threshold: boundary,
                },
                Tri::Yes,
            );
            error!(
                "Server does not support resume of files > {} GiB",
                gib(boundary)
            );
            return OpResult::CriticalError;
        }
        failure(outcome.result)
    }

    fn start_transfer(&mut self, ctx: &mut TransferContext<'_>) -> OpResult {
        let Some(local) = self.request.local_path.clone() else {
            return OpResult::InternalError;
        };
        match self.request.direction {
            Direction::Download => self.start_download(ctx, &local),
            Direction::Upload => self.start_upload(ctx, &local),
        }
    }

    fn start_download(&mut self, ctx: &mut TransferContext<'_>, local: &Path) -> OpResult {
        let backend = ctx.backend();
        let resume = self.request.resume && backend.supports_resume(Direction::Download);
        let offset = if resume { self.local_size.unwrap_or(0) } else { 0 };

        if resume && self.request.binary && self.local_exists && self.remote_size == Some(offset) {
            info!(
                "Skipping download of {}, local file is already complete",
                self.full_remote_name()
            );
            return self.complete_download(ctx, Outcome::AlreadyComplete);
        }

        let factory = WriterFactory::file(local);
        let io = if backend.uses_worker_process() {
            let Some(exporter) = ctx.session.handle_exporter() else {
                error!("No way to hand buffers to the transfer worker");
                return OpResult::CriticalError;
            };
            TransferIo::Worker(SharedIoEndpoint::download(
                factory,
                resume,
                ctx.events.clone(),
                ctx.options.pool,
                exporter,
            ))
        } else {
            match factory.open(
                offset,
                ctx.events,
                ctx.options.pool,
                ctx.options.use_shared_memory,
            ) {
                Ok(w) => TransferIo::Writer(w),
                Err(e) => return open_failed(local, "writing", &e),
            }
        };

        let name = self.remote_name(backend);
        let start = TransferStart {
            command: backend.transfer_command(Direction::Download, resume, false, &name, local),
            mode: TransferMode::Download,
            resume_offset: offset,
            binary: self.request.binary,
        };
        self.begin(ctx, io, start)
    }

    fn start_upload(&mut self, ctx: &mut TransferContext<'_>, local: &Path) -> OpResult {
        let backend = ctx.backend();
        let mut resume = self.request.resume && backend.supports_resume(Direction::Upload);
        if resume && self.remote_size.is_none() {
            debug!("remote size unknown, uploading from the start");
            resume = false;
        }
        let offset = if resume { self.remote_size.unwrap_or(0) } else { 0 };

        if resume && self.request.binary && self.local_size == Some(offset) {
            debug!("No need to resume, remote file size matches local file size");
            return self.upload_finished(ctx, local, Outcome::AlreadyComplete);
        }

        let factory = ReaderFactory::file(local);
        let io = if backend.uses_worker_process() {
            let Some(exporter) = ctx.session.handle_exporter() else {
                error!("No way to hand buffers to the transfer worker");
                return OpResult::CriticalError;
            };
            TransferIo::Worker(SharedIoEndpoint::upload(
                factory,
                ctx.events.clone(),
                ctx.options.pool,
                exporter,
            ))
        } else {
            match factory.open(
                offset,
                ctx.events,
                ctx.options.pool,
                ctx.options.use_shared_memory,
            ) {
                Ok(r) => TransferIo::Reader(r),
                Err(e) => return open_failed(local, "reading", &e),
            }
        };

        let rest_stream = ctx
            .capabilities
            .get(&ctx.server_key(), Capability::RestStream)
            == Tri::Yes;
        // Without REST support a resumed FTP upload appends instead.
        let resume_offset = if resume && (backend != Backend::Ftp || rest_stream) {
            offset
        } else {
            0
        };
        let name = self.remote_name(backend);
        let start = TransferStart {
            command: backend.transfer_command(Direction::Upload, resume, rest_stream, &name, local),
            mode: TransferMode::Upload,
            resume_offset,
            binary: self.request.binary,
        };
        self.begin(ctx, io, start)
    }

    fn begin(
        &mut self,
        ctx: &mut TransferContext<'_>,
        io: TransferIo,
        start: TransferStart,
    ) -> OpResult {
        debug!(command = %start.command, offset = start.resume_offset, "starting transfer");
        self.io = Some(io);
        self.state = OpState::WaitTransfer;
        let r = ctx.session.start_transfer(start);
        self.subcommand(ctx, r)
    }

    fn transfer_done(
        &mut self,
        ctx: &mut TransferContext<'_>,
        outcome: SubcommandOutcome,
    ) -> OpResult {
        let mut open_error = None;
        if let Some(mut io) = self.io.take() {
            if let TransferIo::Worker(endpoint) = &mut io {
                open_error = endpoint.take_open_error();
            }
            io.close();
        }

        if outcome.result != OpResult::Ok {
            if let Some(e) = open_error {
                error!(error = %e, "Failed to open local file");
                return if e.is_alloc() {
                    OpResult::CriticalError
                } else {
                    OpResult::Error
                };
            }
            error!(reason = ?outcome.end_reason, "File transfer failed");
            return failure(outcome.result);
        }

        info!("File transfer successful");
        let Some(local) = self.request.local_path.clone() else {
            return OpResult::InternalError;
        };
        match self.request.direction {
            Direction::Download => self.complete_download(ctx, Outcome::Transferred),
            Direction::Upload => self.upload_finished(ctx, &local, Outcome::Transferred),
        }
    }

    /// Applies the remote time to the local file if asked to, then ends.
    fn complete_download(&mut self, ctx: &TransferContext<'_>, outcome: Outcome) -> OpResult {
        if !ctx.options.preserve_timestamps {
            return self.finish(outcome);
        }
        if let (Some(time), Some(local)) = (self.remote_time, self.request.local_path.as_deref()) {
            if let Err(e) = set_local_mtime(local, time) {
                warn!(path = %local.display(), error = %e, "Could not set modification time");
            }
        }
        self.finish(outcome)
    }

    /// Pushes the local time to the server if asked to and possible, then ends.
    fn upload_finished(
        &mut self,
        ctx: &mut TransferContext<'_>,
        local: &Path,
        outcome: Outcome,
    ) -> OpResult {
        let can_set = ctx
            .backend()
            .can_set_time(&*ctx.capabilities, &ctx.server_key());
        let time = if ctx.options.preserve_timestamps && can_set {
            local_mtime(local)
        } else {
            None
        };
        if let Some(time) = time {
            self.set_time = Some(time);
            self.outcome = Some(outcome);
            self.state = OpState::SetTime;
            return OpResult::Continue;
        }
        self.finish(outcome)
    }

    fn send_set_time(&mut self, ctx: &mut TransferContext<'_>) -> OpResult {
        let backend = ctx.backend();
        let name = self.remote_name(backend);
        let command = self
            .set_time
            .and_then(|t| backend.set_time_command(&name, t, ctx.timezone_offset()));
        match command {
            Some(cmd) => self.send(ctx, &cmd),
            None => self.finish(self.outcome.unwrap_or(Outcome::Transferred)),
        }
    }

    fn finish(&mut self, outcome: Outcome) -> OpResult {
        self.outcome = Some(outcome);
        self.state = OpState::Done;
        OpResult::Ok
    }

    fn send(&mut self, ctx: &mut TransferContext<'_>, command: &str) -> OpResult {
        debug!(command, "sending");
        match ctx.session.send_command(command) {
            OpResult::WouldBlock => {
                self.awaiting_reply = true;
                OpResult::WouldBlock
            }
            r => {
                error!(command, result = ?r, "could not send command");
                failure(r)
            }
        }
    }

    /// Routes a nested operation that finished without blocking.
    fn subcommand(&mut self, ctx: &mut TransferContext<'_>, r: OpResult) -> OpResult {
        if r == OpResult::WouldBlock {
            return OpResult::WouldBlock;
        }
        let end_reason = if r == OpResult::Ok {
            TransferEndReason::Successful
        } else {
            TransferEndReason::None
        };
        self.on_subcommand_result(ctx, SubcommandOutcome { result: r, end_reason })
    }

    fn remote_name(&self, backend: Backend) -> String {
        let omit_path = backend.changes_directory() && !self.try_absolute_path;
        self.request
            .remote_path
            .format_filename(&self.request.remote_file, omit_path)
    }

    fn full_remote_name(&self) -> String {
        self.request
            .remote_path
            .format_filename(&self.request.remote_file, false)
    }
}

impl Drop for TransferOp {
    fn drop(&mut self) {
        if let Some(mut io) = self.io.take() {
            io.close();
        }
    }
}

fn failure(result: OpResult) -> OpResult {
    if result.is_terminal() && result != OpResult::Ok {
        result
    } else {
        OpResult::Error
    }
}

fn open_failed(path: &Path, purpose: &str, e: &AioError) -> OpResult {
    error!(path = %path.display(), error = %e, "Failed to open local file for {purpose}");
    if e.is_alloc() {
        OpResult::CriticalError
    } else {
        OpResult::Error
    }
}

fn gib(bytes: u64) -> u64 {
    bytes >> 30
}

/// Whether a failed SIZE reply says the file does not exist. When the
/// filename itself contains the phrase, only an exact reply text counts.
fn reports_missing_file(line: &str, remote_name: &str) -> bool {
    const PHRASE: &str = "file not found";
    if line.get(4..).is_some_and(|text| text.eq_ignore_ascii_case(PHRASE)) {
        return true;
    }
    !remote_name.to_ascii_lowercase().contains(PHRASE)
        && line.to_ascii_lowercase().contains(PHRASE)
}
