use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;
use mrtd_reader::cancellation::Cancellation;
use mrtd_reader::config::{AccessKeySpec, DEFAULT_MASTER_LIST_WAIT};
use mrtd_reader::face_image::ImageExtractor;
use mrtd_reader::master_list::{MasterListSource, PendingMasterList};
use mrtd_reader::mrz::{self, MrzRecord};
use mrtd_reader::result::ScanResult;
use mrtd_reader::session::{self, DocumentFiles};
use tracing::{debug, error};
use tracing_subscriber::EnvFilter;


#[derive(Clone, Debug, Eq, Hash, Ord, Parser, PartialEq, PartialOrd)]
enum Mode {
    /// Prints the check digit of an MRZ field.
    CheckDigit(CheckDigitOpts),

    /// Prints the MRZ information used to derive BAC and PACE keys.
    MrzKey(MrzKeyOpts),

    /// Parses a machine readable zone and checks its check digits.
    ParseMrz(ParseMrzOpts),

    /// Decodes and verifies document files dumped from a chip.
    Decode(DecodeOpts),
}

#[derive(Clone, Debug, Default, Eq, Hash, Ord, Parser, PartialEq, PartialOrd)]
struct CheckDigitOpts {
    pub value: String,
}

#[derive(Clone, Debug, Default, Eq, Hash, Ord, Parser, PartialEq, PartialOrd)]
struct MrzKeyOpts {
    #[arg(short = 'n', long)]
    pub doc_number: String,

    /// Date of birth as yyyy-MM-dd or YYMMDD.
    #[arg(short = 'b', long)]
    pub dob: String,

    /// Date of expiry as yyyy-MM-dd or YYMMDD.
    #[arg(short = 'e', long)]
    pub doe: String,
}

#[derive(Clone, Debug, Default, Eq, Hash, Ord, Parser, PartialEq, PartialOrd)]
struct ParseMrzOpts {
    #[arg(short, long = "mrz")]
    pub mrz_path: PathBuf,
}

#[derive(Clone, Debug, Default, Eq, Hash, Ord, Parser, PartialEq, PartialOrd)]
struct DecodeOpts {
    #[arg(long)]
    pub sod: PathBuf,

    #[arg(long)]
    pub dg1: PathBuf,

    #[arg(long)]
    pub dg2: Option<PathBuf>,

    /// CSCA master list (or a bundle of certificates) for issuer verification.
    #[arg(short, long)]
    pub master_list: Option<PathBuf>,

    /// Writes the result to this file instead of standard output.
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}


fn read(path: &Path) -> Result<Vec<u8>, ExitCode> {
    std::fs::read(path)
        .map_err(|e| {
            error!(path = %path.display(), error = %e, "failed to read file");
            ExitCode::FAILURE
        })
}


fn parse_mrz(opts: &ParseMrzOpts) -> Result<(), ExitCode> {
    let mrz_string = std::fs::read_to_string(&opts.mrz_path)
        .map_err(|e| {
            error!(path = %opts.mrz_path.display(), error = %e, "failed to read MRZ");
            ExitCode::FAILURE
        })?;
    let mrz = MrzRecord::parse(mrz_string.trim())
        .map_err(|e| {
            error!(error = %e, "failed to parse MRZ");
            ExitCode::FAILURE
        })?;

    println!("{} {} {}", mrz.document_code, mrz.issuing_state, mrz.document_number);
    println!("  name:         {} {}", mrz.primary_identifier, mrz.secondary_identifiers.join(" "));
    println!("  sex:          {}", mrz.sex.as_str());
    println!("MRZ validity check:");
    println!("  document no.: {}", mrz.is_document_number_valid());
    println!("  birth date:   {}", mrz.is_date_of_birth_valid());
    println!("  expiry date:  {}", mrz.is_date_of_expiry_valid());
    Ok(())
}


fn decode(opts: &DecodeOpts) -> Result<(), ExitCode> {
    let files = DocumentFiles {
        sod: read(&opts.sod)?,
        dg1: read(&opts.dg1)?,
        dg2: opts.dg2.as_deref().map(read).transpose()?,
    };
    let master_list = match &opts.master_list {
        Some(path) => PendingMasterList::spawn(MasterListSource::File(path.clone()), None),
        None => PendingMasterList::absent(),
    };

    let outcome = session::process_files(
        &files,
        &ImageExtractor::default(),
        master_list,
        DEFAULT_MASTER_LIST_WAIT,
        &Cancellation::new(),
        &mut |state, within| debug!(?state, within, "progress"),
    );
    let result = match outcome {
        Ok(data) => ScanResult::Success(data),
        Err(e) => ScanResult::Failure {
            kind: e.kind(),
            transient: e.is_transient(),
            message: e.to_string(),
        },
    };

    let json = result.to_json()
        .map_err(|e| {
            error!(error = %e, "failed to serialize result");
            ExitCode::FAILURE
        })?;
    match &opts.output {
        Some(path) => std::fs::write(path, json)
            .map_err(|e| {
                error!(path = %path.display(), error = %e, "failed to write result");
                ExitCode::FAILURE
            })?,
        None => println!("{}", json),
    }

    if result.is_success() {
        Ok(())
    } else {
        Err(ExitCode::from(2))
    }
}


fn run(mode: Mode) -> Result<(), ExitCode> {
    match mode {
        Mode::CheckDigit(opts) => {
            println!("{}", mrz::check_digit(opts.value.to_ascii_uppercase().as_bytes()));
            Ok(())
        },
        Mode::MrzKey(opts) => {
            let spec = AccessKeySpec {
                document_number: opts.doc_number,
                date_of_birth: opts.dob,
                date_of_expiry: opts.doe,
            };
            let key = spec.to_access_key()
                .map_err(|e| {
                    error!(error = %e, "invalid access key");
                    ExitCode::FAILURE
                })?;
            println!("{}", key.mrz_information().as_str());
            Ok(())
        },
        Mode::ParseMrz(opts) => parse_mrz(&opts),
        Mode::Decode(opts) => decode(&opts),
    }
}


fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let mode = Mode::parse();
    match run(mode) {
        Ok(()) => ExitCode::SUCCESS,
        Err(code) => code,
    }
}
