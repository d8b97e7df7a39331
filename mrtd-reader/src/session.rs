//! The session engine: one document, from connecting to the chip to the final result.
//!
//! A session runs on its own worker thread. The caller receives [`Progress`] updates through a
//! channel and the [`ScanResult`] through [`SessionHandle::wait`]. An [`Engine`] runs at most one
//! session at a time; starting another while one is active is ignored.


use std::fmt;
use std::sync::{mpsc, Arc, Mutex, MutexGuard};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use time::OffsetDateTime;
use tracing::{debug, error, info, info_span, warn};

use crate::cancellation::Cancellation;
use crate::config::SessionConfig;
use crate::face_image::{self, ImageCodec, ImageExtractor};
use crate::iso7816::card::{CardService, CommunicationError};
use crate::lds::{self, dg1, dg2, EfIdentifier};
use crate::lds::sod::DocumentSecurityObject;
use crate::master_list::{MasterListFetcher, MasterListStatus, PendingMasterList};
use crate::negotiation::{self, AccessControl, Icao9303};
use crate::passive_auth;
use crate::reader::{self, FileReader};
use crate::result::{DocumentData, ErrorKind, ScanResult};
use crate::transport::Transport;


/// The phases of a session, in order.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum SessionState {
    Idle,
    Connecting,
    Negotiating,
    ReadingSod,
    ReadingDg1,
    ReadingDg2,
    ExtractingImage,
    VerifyingSignature,
    VerifyingIssuer,
    Finished,
}
impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished)
    }

    /// Where the phase starts on the overall progress scale and how much of it the phase covers.
    const fn progress_range(&self) -> (f32, f32) {
        match self {
            Self::Idle => (0.0, 0.0),
            Self::Connecting => (0.0, 0.0),
            Self::Negotiating => (0.2, 0.0),
            Self::ReadingSod => (0.2, 0.2),
            Self::ReadingDg1 => (0.4, 0.2),
            Self::ReadingDg2 => (0.6, 0.0),
            Self::ExtractingImage => (0.6, 0.2),
            Self::VerifyingSignature => (0.8, 0.0),
            Self::VerifyingIssuer => (0.9, 0.0),
            Self::Finished => (1.0, 0.0),
        }
    }

    pub const fn message(&self) -> &'static str {
        match self {
            Self::Idle => "Waiting",
            Self::Connecting => "Reading",
            Self::Negotiating => "Authenticating",
            Self::ReadingSod => "Reading document security object",
            Self::ReadingDg1 => "Reading personal data",
            Self::ReadingDg2 => "Reading photo",
            Self::ExtractingImage => "Reading photo",
            Self::VerifyingSignature => "Verifying signature",
            Self::VerifyingIssuer => "Verifying issuer",
            Self::Finished => "Done",
        }
    }
}


/// How far a session has come.
#[derive(Clone, Debug, PartialEq)]
pub struct Progress {
    /// Between 0 and 1; never decreases within a session.
    pub fraction: f32,
    pub message: String,
}


#[derive(Debug)]
pub enum ScanError {
    /// The link to the chip failed outside of file reading.
    TransportFault(CommunicationError),

    AuthenticationFailed(negotiation::Error),

    FileReadFailed { file: EfIdentifier, error: reader::Error },

    LdsParseError(lds::Error),

    /// None of the face images could be decoded.
    ImageDecodeFailed { records: usize },

    SignatureCheckFailed(passive_auth::Error),

    /// No trusted certificate vouches for the document signer.
    IssuerUnverified,
}
impl ScanError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::TransportFault(_) => ErrorKind::TransportFault,
            Self::AuthenticationFailed(_) => ErrorKind::AuthenticationFailed,
            Self::FileReadFailed { .. } => ErrorKind::FileReadFailed,
            Self::LdsParseError(_) => ErrorKind::LdsParseError,
            Self::ImageDecodeFailed { .. } => ErrorKind::ImageDecodeFailed,
            Self::SignatureCheckFailed(_) => ErrorKind::SignatureCheckFailed,
            Self::IssuerUnverified => ErrorKind::IssuerUnverified,
        }
    }

    /// Whether the failure was caused by the link (typically the document moving away from the
    /// reader), so that trying again is worthwhile.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::TransportFault(_) => true,
            Self::FileReadFailed { error: reader::Error::Exhausted { last_error: Some(last), .. }, .. }
                => last.is_transport_fault(),
            Self::FileReadFailed { error, .. } => error.is_transport_fault(),
            _ => false,
        }
    }
}
impl fmt::Display for ScanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TransportFault(e)
                => write!(f, "lost connection to the document: {}", e),
            Self::AuthenticationFailed(e)
                => write!(f, "authentication failed: {}", e),
            Self::FileReadFailed { file, error }
                => write!(f, "failed to read {}: {}", file, error),
            Self::LdsParseError(e)
                => write!(f, "{}", e),
            Self::ImageDecodeFailed { records }
                => write!(f, "none of {} face images could be decoded", records),
            Self::SignatureCheckFailed(e)
                => write!(f, "document signature not verified: {}", e),
            Self::IssuerUnverified
                => write!(f, "document signer not issued by a trusted authority"),
        }
    }
}
impl std::error::Error for ScanError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::TransportFault(e) => Some(e),
            Self::AuthenticationFailed(e) => Some(e),
            Self::FileReadFailed { error, .. } => Some(error),
            Self::LdsParseError(e) => Some(e),
            Self::SignatureCheckFailed(e) => Some(e),
            Self::ImageDecodeFailed { .. } | Self::IssuerUnverified => None,
        }
    }
}
impl From<lds::Error> for ScanError {
    fn from(value: lds::Error) -> Self { Self::LdsParseError(value) }
}


/// The raw files of a document.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DocumentFiles {
    pub sod: Vec<u8>,
    pub dg1: Vec<u8>,
    pub dg2: Option<Vec<u8>>,
}


/// Decodes the files, extracts the face image and performs passive authentication.
///
/// `progress` is told about each phase and how far into it processing is. Waiting for the master
/// list ends early once `cancellation` fires; the issuer then counts as unverified.
pub fn process_files(
    files: &DocumentFiles,
    extractor: &ImageExtractor,
    master_list: PendingMasterList,
    master_list_wait: Duration,
    cancellation: &Cancellation,
    progress: &mut dyn FnMut(SessionState, f32),
) -> Result<DocumentData, ScanError> {
    let sod = DocumentSecurityObject::decode(&files.sod)?;
    let mrz = dg1::decode(&files.dg1)?;
    let mut data = DocumentData::from_mrz(&mrz, OffsetDateTime::now_utc().date());
    let records = match &files.dg2 {
        Some(dg2) => dg2::decode(dg2)?,
        None => Vec::new(),
    };

    progress(SessionState::ExtractingImage, 0.0);
    match extractor.extract_face_image(&records, |fraction| progress(SessionState::ExtractingImage, fraction)) {
        Some(image) => match face_image::encode_jpeg(&image) {
            Ok(jpeg) => data.face_image = jpeg,
            Err(e) => warn!(error = %e, "failed to re-encode face image"),
        },
        None => debug!(error = %ScanError::ImageDecodeFailed { records: records.len() }, "continuing without face image"),
    }

    progress(SessionState::VerifyingSignature, 0.0);
    let mut signature_verified = match passive_auth::check_document_signature(&sod) {
        Ok(()) => true,
        Err(e) => {
            warn!(error = %ScanError::SignatureCheckFailed(e), "continuing unverified");
            false
        },
    };
    let data_groups = [(1, Some(&files.dg1)), (2, files.dg2.as_ref())];
    for (number, contents) in data_groups {
        if let Some(contents) = contents {
            if !passive_auth::verify_data_group_hash(&sod, number, contents) {
                signature_verified = false;
            }
        }
    }
    data.signature_verified = signature_verified;

    progress(SessionState::VerifyingIssuer, 0.0);
    let status = master_list.wait(master_list_wait, cancellation);
    if let MasterListStatus::Cancelled = status {
        return Ok(data);
    }
    data.issuer_verified = match (sod.signer_certificate(), &status) {
        (Some(certificate), MasterListStatus::Available(certificates))
            => passive_auth::verify_issuer(certificate, certificates),
        _ => false,
    };
    if !data.issuer_verified {
        debug!(error = %ScanError::IssuerUnverified, master_list_certificates = status.certificates().len(), "continuing unverified");
    }

    Ok(data)
}


fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}


/// Publishes phase changes and keeps the reported progress from going backwards.
struct Tracker {
    shared_state: Arc<Mutex<SessionState>>,
    sink: mpsc::Sender<Progress>,
    current: SessionState,
    fraction: f32,
}
impl Tracker {
    fn new(shared_state: Arc<Mutex<SessionState>>, sink: mpsc::Sender<Progress>) -> Self {
        Self {
            shared_state,
            sink,
            current: SessionState::Idle,
            fraction: 0.0,
        }
    }

    fn update(&mut self, state: SessionState, within: f32) {
        let entered = state != self.current;
        if entered {
            info!(?state, "session phase");
            self.current = state;
            *lock(&self.shared_state) = state;
        }

        let (start, width) = state.progress_range();
        let fraction = (start + width * within.clamp(0.0, 1.0)).max(self.fraction);
        if entered || fraction > self.fraction {
            self.fraction = fraction;
            // nobody listening is fine
            let _ = self.sink.send(Progress { fraction, message: state.message().to_owned() });
        }
    }
}


enum Interrupt {
    Cancelled,
    Failed(ScanError),
}
impl From<ScanError> for Interrupt {
    fn from(value: ScanError) -> Self { Self::Failed(value) }
}


fn read_file<T: Transport>(
    reader: &mut FileReader<'_, T>,
    file: EfIdentifier,
    state: SessionState,
    tracker: &mut Tracker,
) -> Result<Vec<u8>, Interrupt> {
    tracker.update(state, 0.0);
    reader.read_file(file, &mut |read, total| tracker.update(state, read as f32 / total.max(1) as f32))
        .map_err(|error| if error.is_cancelled() {
            Interrupt::Cancelled
        } else {
            ScanError::FileReadFailed { file, error }.into()
        })
}


fn read_document<T: Transport>(
    service: &mut CardService<T>,
    config: &SessionConfig,
    access_control: &mut dyn AccessControl,
    extractor: &ImageExtractor,
    master_list: PendingMasterList,
    tracker: &mut Tracker,
) -> Result<DocumentData, Interrupt> {
    tracker.update(SessionState::Connecting, 0.0);
    let transport = service.transport_mut();
    transport.connect()
        .map_err(|e| ScanError::TransportFault(e.into()))?;
    transport.set_timeout(config.connect_timeout);

    tracker.update(SessionState::Negotiating, 0.0);
    let block_sizes = config.retry.block_sizes_for(service.transport().max_transceive_length());
    debug!(?block_sizes, "block size candidates");
    let first_block_size = block_sizes.first().copied().unwrap_or(0xE0);
    let kind = negotiation::negotiate(service, access_control, &config.access_key, first_block_size)
        .map_err(|e| match e {
            negotiation::Error::Cancelled => Interrupt::Cancelled,
            negotiation::Error::Transport(e) => ScanError::TransportFault(e).into(),
            e => ScanError::AuthenticationFailed(e).into(),
        })?;
    debug!(%kind, "reading files");

    let mut reader = FileReader::new(service, config.retry.clone(), config.connect_timeout);
    let files = DocumentFiles {
        sod: read_file(&mut reader, EfIdentifier::Sod, SessionState::ReadingSod, tracker)?,
        dg1: read_file(&mut reader, EfIdentifier::Dg1, SessionState::ReadingDg1, tracker)?,
        dg2: Some(read_file(&mut reader, EfIdentifier::Dg2, SessionState::ReadingDg2, tracker)?),
    };

    let cancellation = reader.service().cancellation().clone();
    if cancellation.is_cancelled() {
        return Err(Interrupt::Cancelled);
    }
    Ok(process_files(
        &files, extractor, master_list, config.master_list_wait, &cancellation,
        &mut |state, within| tracker.update(state, within),
    )?)
}


/// Runs a session to its end. The transport is disconnected exactly once, whatever the outcome.
fn run_session<T: Transport>(
    transport: T,
    config: &SessionConfig,
    access_control: &mut dyn AccessControl,
    extractor: &ImageExtractor,
    master_list: PendingMasterList,
    cancellation: &Cancellation,
    tracker: &mut Tracker,
) -> ScanResult {
    let mut service = CardService::new(transport, cancellation.clone());
    let outcome = read_document(&mut service, config, access_control, extractor, master_list, tracker);

    // dropping the service discards the secure channel
    let mut transport = service.into_transport();
    transport.disconnect();

    let result = match outcome {
        Ok(_) if cancellation.is_cancelled() => ScanResult::Cancelled,
        Ok(data) => ScanResult::Success(data),
        Err(Interrupt::Cancelled) => ScanResult::Cancelled,
        Err(Interrupt::Failed(_)) if cancellation.is_cancelled() => ScanResult::Cancelled,
        Err(Interrupt::Failed(e)) => {
            warn!(error = %e, kind = ?e.kind(), transient = e.is_transient(), "session failed");
            ScanResult::Failure {
                kind: e.kind(),
                transient: e.is_transient(),
                message: e.to_string(),
            }
        },
    };
    tracker.update(SessionState::Finished, 0.0);
    result
}


struct BusyGuard(Arc<AtomicBool>);
impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}


type AccessControlFactory = dyn Fn() -> Box<dyn AccessControl> + Send + Sync;


/// Runs reading sessions, one at a time.
pub struct Engine {
    busy: Arc<AtomicBool>,
    extractor: Arc<ImageExtractor>,
    fetcher: Option<Arc<dyn MasterListFetcher>>,
    access_control: Arc<AccessControlFactory>,
}
impl Engine {
    pub fn new() -> Self {
        Self {
            busy: Arc::new(AtomicBool::new(false)),
            extractor: Arc::new(ImageExtractor::default()),
            fetcher: None,
            access_control: Arc::new(|| -> Box<dyn AccessControl> { Box::new(Icao9303) }),
        }
    }

    /// Tries `codec` (e.g. a JPEG 2000 decoder) before the built-in raster codecs.
    pub fn with_image_codec(mut self, codec: Box<dyn ImageCodec>) -> Self {
        self.extractor = Arc::new(ImageExtractor::new(Some(codec)));
        self
    }

    pub fn with_master_list_fetcher(mut self, fetcher: Arc<dyn MasterListFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn with_access_control<F>(mut self, factory: F) -> Self
        where F: Fn() -> Box<dyn AccessControl> + Send + Sync + 'static {
        self.access_control = Arc::new(factory);
        self
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Starts reading the document behind `transport`.
    ///
    /// Returns `None` without touching `transport` if a session is already active.
    pub fn start<T: Transport + 'static>(
        &self,
        transport: T,
        config: SessionConfig,
        progress: mpsc::Sender<Progress>,
    ) -> Option<SessionHandle> {
        if self.busy.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_err() {
            warn!("a session is already active; ignoring start");
            return None;
        }
        let busy = BusyGuard(Arc::clone(&self.busy));

        let cancellation = Cancellation::new();
        let state = Arc::new(Mutex::new(SessionState::Idle));
        let (result_sender, result_receiver) = mpsc::channel();

        let worker_cancellation = cancellation.clone();
        let worker_state = Arc::clone(&state);
        let extractor = Arc::clone(&self.extractor);
        let access_control = Arc::clone(&self.access_control);
        let master_list = PendingMasterList::spawn(config.master_list.clone(), self.fetcher.clone());

        let spawned = thread::Builder::new()
            .name("mrtd-session".to_owned())
            .spawn(move || {
                let span = info_span!("session");
                let _entered = span.enter();

                let mut tracker = Tracker::new(worker_state, progress);
                let mut access_control = (*access_control)();
                let result = run_session(
                    transport, &config, access_control.as_mut(), &extractor, master_list,
                    &worker_cancellation, &mut tracker,
                );
                drop(busy);
                // the caller may have dropped the handle
                let _ = result_sender.send(result);
            });
        match spawned {
            Ok(worker) => Some(SessionHandle {
                cancellation,
                state,
                result: result_receiver,
                worker: Some(worker),
            }),
            Err(e) => {
                error!(error = %e, "failed to spawn session worker");
                None
            },
        }
    }
}
impl Default for Engine {
    fn default() -> Self { Self::new() }
}
impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("busy", &self.is_busy())
            .field("extractor", &self.extractor)
            .field("has_fetcher", &self.fetcher.is_some())
            .finish()
    }
}


/// The caller's side of a running session.
#[derive(Debug)]
pub struct SessionHandle {
    cancellation: Cancellation,
    state: Arc<Mutex<SessionState>>,
    result: mpsc::Receiver<ScanResult>,
    worker: Option<JoinHandle<()>>,
}
impl SessionHandle {
    /// Asks the session to stop at the next card exchange.
    pub fn cancel(&self) {
        info!("session cancellation requested");
        self.cancellation.cancel();
    }

    pub fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    /// Blocks until the session has ended.
    pub fn wait(mut self) -> ScanResult {
        let result = self.result.recv();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("session worker panicked");
            }
        }
        match result {
            Ok(result) => result,
            Err(_) => {
                error!("session ended without a result");
                ScanResult::Cancelled
            },
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;
    use der::Encode;
    use der::asn1::ObjectIdentifier;
    use p256::ecdsa::SigningKey;
    use p256::ecdsa::signature::Signer;
    use sha2::{Digest, Sha256};
    use crate::config::RetryPolicy;
    use crate::crypt::cipher_mac::Cam3Des;
    use crate::der_util::encode_tlv;
    use crate::face_image::tests::tiny_jpeg;
    use crate::iso7816::card::SmartCard;
    use crate::lds::dg2::tests::{facial_record, wrap_dg2};
    use crate::lds::sod::tests::{build_sod, security_object};
    use crate::master_list::MasterListSource;
    use crate::mrz::AccessKey;
    use crate::passive_auth::tests::{algorithm, issue};
    use crate::reader::tests::SimulatedChip;
    use crate::secure_messaging::{ChannelKind, SecureChannel};
    use crate::secure_messaging::tests::ChipChannel;
    use crate::transport::TransportError;

    const SHA256_WITH_ECDSA: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.4.3.2");
    const MRZ: &[u8] = b"P<UTOERIKSSON<<ANNA<MARIA<<<<<<<<<<<<<<<<<<<L898902C36UTO7408122F1204159ZE184226B<<<<<10";

    /// Blocks in the first exchange until released, answering `6A 82` to everything.
    struct BlockingTransport {
        entered: mpsc::Sender<()>,
        release: mpsc::Receiver<()>,
        disconnects: Arc<AtomicUsize>,
    }
    impl Transport for BlockingTransport {
        fn connect(&mut self) -> Result<(), TransportError> { Ok(()) }
        fn disconnect(&mut self) {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
        }
        fn transceive(&mut self, _command: &[u8]) -> Result<Vec<u8>, TransportError> {
            let _ = self.entered.send(());
            let _ = self.release.recv();
            Ok(vec![0x6A, 0x82])
        }
        fn set_timeout(&mut self, _timeout: Duration) {}
        fn max_transceive_length(&self) -> usize { 261 }
    }

    fn config() -> SessionConfig {
        let mut config = SessionConfig::new(AccessKey::new("L898902C", "740812", "120415"));
        config.retry = RetryPolicy::immediate();
        config
    }

    fn dg1(mrz: &[u8]) -> Vec<u8> {
        let mut inner = Vec::new();
        encode_tlv(&mut inner, 0x5F1F, mrz);
        let mut dg1 = Vec::new();
        encode_tlv(&mut dg1, 0x61, &inner);
        dg1
    }

    #[test]
    fn cancellation_and_single_active_session() {
        let engine = Engine::new();
        let (entered_sender, entered) = mpsc::channel();
        let (release, release_receiver) = mpsc::channel();
        let disconnects = Arc::new(AtomicUsize::new(0));
        let transport = BlockingTransport {
            entered: entered_sender,
            release: release_receiver,
            disconnects: Arc::clone(&disconnects),
        };
        let (progress_sender, progress) = mpsc::channel();

        let handle = engine.start(transport, config(), progress_sender).unwrap();
        entered.recv_timeout(Duration::from_secs(10)).unwrap();
        assert_eq!(handle.state(), SessionState::Negotiating);
        assert!(engine.is_busy());

        let (ignored_sender, _ignored) = mpsc::channel();
        assert!(engine.start(SimulatedChip::new(&[]), config(), ignored_sender).is_none());

        handle.cancel();
        release.send(()).unwrap();
        drop(release);
        assert_eq!(handle.wait(), ScanResult::Cancelled);
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
        assert!(!engine.is_busy());

        let reports: Vec<Progress> = progress.try_iter().collect();
        assert!(reports.windows(2).all(|w| w[0].fraction <= w[1].fraction));
        assert_eq!(reports.last().map(|p| p.fraction), Some(1.0));
        assert_eq!(reports[1].message, "Authenticating");
    }

    #[test]
    fn failed_authentication_is_reported() {
        let engine = Engine::new();
        let chip = SimulatedChip::new(&[]);
        let log = chip.log.clone();
        let (progress_sender, _progress) = mpsc::channel();

        let handle = engine.start(chip, config(), progress_sender).unwrap();
        match handle.wait() {
            ScanResult::Failure { kind, transient, .. } => {
                assert_eq!(kind, ErrorKind::AuthenticationFailed);
                assert!(!transient);
            },
            other => panic!("unexpected result {:?}", other),
        }
        assert_eq!(log.lock().unwrap().disconnects, 1);
    }

    #[test]
    fn transient_classification() {
        let lost = ScanError::FileReadFailed {
            file: EfIdentifier::Dg2,
            error: reader::Error::Exhausted {
                file: EfIdentifier::Dg2,
                last_error: Some(Box::new(reader::Error::Communication(TransportError::LinkLost.into()))),
            },
        };
        assert!(lost.is_transient());
        assert_eq!(lost.kind(), ErrorKind::FileReadFailed);
        assert!(ScanError::TransportFault(TransportError::Timeout.into()).is_transient());
        assert!(!ScanError::IssuerUnverified.is_transient());
    }

    /// A document signed by a freshly made document signer under a freshly made CSCA; also returns
    /// the DER encoding of the CSCA certificate.
    fn signed_document(mrz: &[u8]) -> (DocumentFiles, Vec<u8>) {
        let mut rng = rand::rngs::OsRng;
        let csca_key = SigningKey::random(&mut rng);
        let ds_key = SigningKey::random(&mut rng);
        let csca = issue("CN=CSCA,C=UT", &csca_key, "CN=CSCA,C=UT", &csca_key);
        let ds = issue("CN=Document Signer,C=UT", &ds_key, "CN=CSCA,C=UT", &csca_key);

        let dg1 = dg1(mrz);
        let dg2 = wrap_dg2(&[facial_record(&[(0, &tiny_jpeg()[..])], 0)]);
        let content = security_object(&[(1, &Sha256::digest(&dg1)[..]), (2, &Sha256::digest(&dg2)[..])]);
        let signature: p256::ecdsa::Signature = ds_key.sign(&content);
        let sod = build_sod(&content, Some(ds), algorithm(SHA256_WITH_ECDSA), None, signature.to_der().as_bytes());
        (DocumentFiles { sod, dg1, dg2: Some(dg2) }, csca.to_der().unwrap())
    }

    #[test]
    fn processing_verifies_everything() {
        let (files, csca) = signed_document(MRZ);
        let master_list = PendingMasterList::spawn(MasterListSource::Certificates(vec![csca]), None);
        let mut phases = Vec::new();
        let data = process_files(
            &files, &ImageExtractor::default(), master_list, Duration::from_secs(10), &Cancellation::new(),
            &mut |state, _| if phases.last() != Some(&state) { phases.push(state) },
        ).unwrap();
        assert_eq!(phases, vec![SessionState::ExtractingImage, SessionState::VerifyingSignature, SessionState::VerifyingIssuer]);
        assert_eq!(data.primary_identifier, "ERIKSSON");
        assert!(data.signature_verified);
        assert!(data.issuer_verified);
        assert_eq!(&data.face_image[..2], &[0xFF, 0xD8]);

        // a data group that does not match its hash
        let tampered = DocumentFiles {
            dg1: dg1(&MRZ.iter().map(|b| if *b == b'F' { b'M' } else { *b }).collect::<Vec<u8>>()),
            ..files
        };
        let data = process_files(
            &tampered, &ImageExtractor::default(), PendingMasterList::absent(), Duration::ZERO, &Cancellation::new(), &mut |_, _| {},
        ).unwrap();
        assert_eq!(data.gender, crate::mrz::Sex::Male);
        assert!(!data.signature_verified);
        assert!(!data.issuer_verified);
    }

    const BAC_ENC: [u8; 16] = [0x11; 16];
    const BAC_MAC: [u8; 16] = [0x22; 16];

    fn bac_channel() -> SecureChannel {
        SecureChannel::new(Box::new(Cam3Des), ChannelKind::Bac, &BAC_ENC, &BAC_MAC, &[0x00; 8]).unwrap()
    }

    /// Hands out fixed BAC session keys instead of running the protocol.
    struct FixedKeys;
    impl AccessControl for FixedKeys {
        fn pace(&mut self, _card: &mut dyn SmartCard, _security_infos: &[u8], _mrz_information: &[u8]) -> Result<SecureChannel, CommunicationError> {
            Err(CommunicationError::Cancelled)
        }
        fn bac(&mut self, _card: &mut dyn SmartCard, _mrz_information: &[u8]) -> Result<SecureChannel, CommunicationError> {
            Ok(bac_channel())
        }
    }

    /// Holds up the first READ BINARY of DG2 until released.
    struct Dg2Pause {
        entered: mpsc::Sender<()>,
        release: mpsc::Receiver<()>,
    }

    /// A chip without PACE that serves its files through BAC Secure Messaging.
    struct BacDocumentChip {
        files: HashMap<u16, Vec<u8>>,
        selected: Option<u16>,
        channel: ChipChannel,
        disconnects: Arc<AtomicUsize>,
        dg2_reads: Arc<AtomicUsize>,
        dg2_pause: Option<Dg2Pause>,
    }
    impl BacDocumentChip {
        fn new(files: &DocumentFiles) -> Self {
            let mut contents = HashMap::from([
                (EfIdentifier::Sod.file_id(), files.sod.clone()),
                (EfIdentifier::Dg1.file_id(), files.dg1.clone()),
            ]);
            if let Some(dg2) = &files.dg2 {
                contents.insert(EfIdentifier::Dg2.file_id(), dg2.clone());
            }
            Self {
                files: contents,
                selected: None,
                channel: ChipChannel(bac_channel()),
                disconnects: Arc::new(AtomicUsize::new(0)),
                dg2_reads: Arc::new(AtomicUsize::new(0)),
                dg2_pause: None,
            }
        }

        fn answer(&mut self, command: &[u8]) -> Vec<u8> {
            if command[0] & 0x0C == 0 {
                return match (command[1], command[2]) {
                    (0xA4, 0x04) => vec![0x90, 0x00],
                    (0xA4, _) => vec![0x6A, 0x82],
                    _ => vec![0x6D, 0x00],
                };
            }
            let Some(opened) = self.channel.open(command) else {
                return vec![0x69, 0x88];
            };
            match opened.ins {
                0xA4 if opened.data.len() == 2 => {
                    let file_id = u16::from_be_bytes([opened.data[0], opened.data[1]]);
                    if self.files.contains_key(&file_id) {
                        self.selected = Some(file_id);
                        self.channel.protect(&[], [0x90, 0x00])
                    } else {
                        self.channel.protect(&[], [0x6A, 0x82])
                    }
                },
                0xB0 => {
                    if self.selected == Some(EfIdentifier::Dg2.file_id()) {
                        let reads = self.dg2_reads.fetch_add(1, Ordering::SeqCst);
                        if let (0, Some(pause)) = (reads, &self.dg2_pause) {
                            let _ = pause.entered.send(());
                            let _ = pause.release.recv();
                        }
                    }
                    let Some(contents) = self.selected.and_then(|id| self.files.get(&id)) else {
                        return self.channel.protect(&[], [0x69, 0x86]);
                    };
                    let offset = usize::from(u16::from_be_bytes([opened.p1 & 0x7F, opened.p2]));
                    let end = (offset + opened.le.unwrap_or(256)).min(contents.len());
                    let chunk = contents.get(offset..end).unwrap_or(&[]).to_vec();
                    self.channel.protect(&chunk, [0x90, 0x00])
                },
                _ => self.channel.protect(&[], [0x6D, 0x00]),
            }
        }
    }
    impl Transport for BacDocumentChip {
        fn connect(&mut self) -> Result<(), TransportError> { Ok(()) }
        fn disconnect(&mut self) {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
        }
        fn transceive(&mut self, command: &[u8]) -> Result<Vec<u8>, TransportError> {
            Ok(self.answer(command))
        }
        fn set_timeout(&mut self, _timeout: Duration) {}
        fn max_transceive_length(&self) -> usize { 261 }
    }

    #[test]
    fn reads_and_verifies_a_document() {
        let (files, csca) = signed_document(MRZ);
        let chip = BacDocumentChip::new(&files);
        let disconnects = Arc::clone(&chip.disconnects);
        let mut config = config();
        config.master_list = MasterListSource::Certificates(vec![csca]);

        let engine = Engine::new()
            .with_access_control(|| -> Box<dyn AccessControl> { Box::new(FixedKeys) });
        let (progress_sender, progress) = mpsc::channel();
        let handle = engine.start(chip, config, progress_sender).unwrap();
        let data = match handle.wait() {
            ScanResult::Success(data) => data,
            other => panic!("unexpected result {:?}", other),
        };
        assert_eq!(data.document_number, "L898902C3");
        assert_eq!(data.secondary_identifiers, vec!["ANNA", "MARIA"]);
        assert!(data.has_face_image());
        assert!(data.signature_verified);
        assert!(data.issuer_verified);
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);

        let reports: Vec<Progress> = progress.try_iter().collect();
        assert!(reports.windows(2).all(|w| w[0].fraction <= w[1].fraction));
        assert!(reports.iter().any(|p| p.message == "Reading photo"));
        assert_eq!(reports.last(), Some(&Progress { fraction: 1.0, message: "Done".to_owned() }));
    }

    #[test]
    fn cancellation_during_photo_read() {
        let (files, csca) = signed_document(MRZ);
        let mut chip = BacDocumentChip::new(&files);
        let disconnects = Arc::clone(&chip.disconnects);
        let dg2_reads = Arc::clone(&chip.dg2_reads);
        let (entered_sender, entered) = mpsc::channel();
        let (release, release_receiver) = mpsc::channel();
        chip.dg2_pause = Some(Dg2Pause { entered: entered_sender, release: release_receiver });
        let mut config = config();
        config.master_list = MasterListSource::Certificates(vec![csca]);
        config.retry.block_sizes = Some(vec![0x20]);

        let engine = Engine::new()
            .with_access_control(|| -> Box<dyn AccessControl> { Box::new(FixedKeys) });
        let (progress_sender, _progress) = mpsc::channel();
        let handle = engine.start(chip, config, progress_sender).unwrap();
        entered.recv_timeout(Duration::from_secs(10)).unwrap();
        assert_eq!(handle.state(), SessionState::ReadingDg2);

        handle.cancel();
        release.send(()).unwrap();
        assert_eq!(handle.wait(), ScanResult::Cancelled);
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
        // the photo spans several blocks but no block after the cancelled one was requested
        assert!(files.dg2.as_ref().map_or(0, Vec::len) > 0x40);
        assert_eq!(dg2_reads.load(Ordering::SeqCst), 1);
    }

    /// Never delivers a master list; `fetch` returns once the sender is dropped.
    struct StalledFetcher(Mutex<mpsc::Receiver<()>>);
    impl MasterListFetcher for StalledFetcher {
        fn fetch(&self, _url: &str) -> Result<Vec<u8>, String> {
            let _ = lock(&self.0).recv();
            Err("stalled".to_owned())
        }
    }

    #[test]
    fn cancellation_during_master_list_wait() {
        let (files, _csca) = signed_document(MRZ);
        let chip = BacDocumentChip::new(&files);
        let disconnects = Arc::clone(&chip.disconnects);
        let (unstall, stalled) = mpsc::channel::<()>();
        let mut config = config();
        config.master_list = MasterListSource::Url("https://example.org/stalled.ml".to_owned());
        config.master_list_wait = Duration::from_secs(60);

        let engine = Engine::new()
            .with_access_control(|| -> Box<dyn AccessControl> { Box::new(FixedKeys) })
            .with_master_list_fetcher(Arc::new(StalledFetcher(Mutex::new(stalled))));
        let (progress_sender, progress) = mpsc::channel();
        let handle = engine.start(chip, config, progress_sender).unwrap();
        loop {
            let report = progress.recv_timeout(Duration::from_secs(10)).unwrap();
            if report.message == SessionState::VerifyingIssuer.message() {
                break;
            }
        }

        let start = std::time::Instant::now();
        handle.cancel();
        assert_eq!(handle.wait(), ScanResult::Cancelled);
        assert!(start.elapsed() < Duration::from_secs(10));
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
        drop(unstall);
    }

    #[test]
    fn malformed_files_are_fatal() {
        let files = DocumentFiles { sod: vec![0x77, 0x00], dg1: dg1(MRZ), dg2: None };
        let error = process_files(
            &files, &ImageExtractor::default(), PendingMasterList::absent(), Duration::ZERO, &Cancellation::new(), &mut |_, _| {},
        ).unwrap_err();
        assert_eq!(error.kind(), ErrorKind::LdsParseError);
        assert!(!error.is_transient());
    }
}
