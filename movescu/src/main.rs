use std::io::stderr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgGroup, Parser};
use dicom_dump::DumpOptions;
use dicom_movescu::{
    resolve, status_description, AssociationSession, ConfigError, Device, MoveResponse,
    MoveScuOptions, MoveStatus, Priority, RetrieveLevel, RetrieveModel, RetrieveSettings,
    TransferSyntaxPolicy,
};
use indicatif::{ProgressBar, ProgressStyle};
use snafu::prelude::*;
use snafu::Report;
use tracing::{debug, error, info, warn, Level};

/// DICOM C-MOVE SCU
#[derive(Debug, Parser)]
#[command(version)]
#[command(group(ArgGroup::new("model").multiple(false)))]
#[command(group(ArgGroup::new("transfer-syntax").multiple(false)))]
struct App {
    /// socket address to the MOVE SCP,
    /// optionally prefixed with its AE title
    /// (example: "QR-SCP@127.0.0.1:1045")
    addr: String,
    /// DICOM files supplying the base identifier,
    /// one retrieve per file
    files: Vec<PathBuf>,

    /// use patient root information model
    #[arg(short = 'P', long, group = "model")]
    patient_root: bool,
    /// use study root information model
    #[arg(short = 'S', long, group = "model")]
    study_root: bool,
    /// use patient/study only information model (retired)
    #[arg(short = 'O', long, group = "model")]
    patient_study_only: bool,
    /// use composite instance root information model
    #[arg(short = 'I', long, group = "model")]
    instance_root: bool,
    /// use hanging protocol information model
    #[arg(short = 'H', long, group = "model")]
    hanging_protocol: bool,
    /// use color palette information model
    #[arg(short = 'C', long, group = "model")]
    color_palette: bool,

    /// the retrieve level (PATIENT, STUDY, SERIES, IMAGE or FRAME)
    #[arg(short = 'L', long = "level")]
    level: Option<RetrieveLevel>,

    /// propose explicit VR little endian first
    #[arg(long, group = "transfer-syntax")]
    explicit_vr: bool,
    /// propose explicit VR big endian first
    #[arg(long, group = "transfer-syntax")]
    big_endian: bool,
    /// propose implicit VR little endian only
    #[arg(long, group = "transfer-syntax")]
    implicit_vr: bool,

    /// request relational retrieve
    #[arg(long)]
    relational: bool,

    /// a matching key in the form `«tag»=«value»`
    /// (example: "StudyInstanceUID=1.2.3")
    #[arg(short = 'm', long = "key")]
    keys: Vec<String>,
    /// a file containing lines of matching keys
    #[arg(long)]
    query_file: Option<PathBuf>,

    /// the C-MOVE destination AE title
    #[arg(long = "dest")]
    dest: Option<String>,
    /// the request priority (0: medium, 1: high, 2: low)
    #[arg(
        long,
        default_value_t = 0,
        value_parser(clap::value_parser!(u16).range(0..=2))
    )]
    priority: u16,

    /// the calling AE title
    #[arg(long = "calling-ae-title", default_value = "MOVESCU")]
    calling_ae_title: String,
    /// the called AE title
    #[arg(long = "called-ae-title")]
    called_ae_title: Option<String>,
    /// the maximum PDU length
    #[arg(
        long = "max-pdu-length",
        default_value = "16384",
        value_parser(clap::value_parser!(u32).range(4096..=131_072))
    )]
    max_pdu_length: u32,
    /// Enforce max pdu length
    #[arg(short = 's', long = "strict")]
    strict: bool,
    /// timeout for each DIMSE response, in milliseconds
    #[arg(long = "rsp-timeout")]
    rsp_timeout: Option<u64>,

    /// verbose mode
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,
}

#[derive(Debug, Snafu)]
enum Error {
    /// Could not open association
    Open { source: dicom_movescu::session::Error },

    #[snafu(display("Could not retrieve with {}", label))]
    Retrieve {
        label: String,
        source: dicom_movescu::session::Error,
    },

    /// Could not close association
    Close { source: dicom_movescu::session::Error },
}

fn main() {
    let app = App::parse();

    tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_max_level(if app.verbose {
                Level::DEBUG
            } else {
                Level::INFO
            })
            .finish(),
    )
    .unwrap_or_else(|e| {
        eprintln!("{}", Report::from_error(e));
    });

    let settings = build_settings(&app).unwrap_or_else(|e| {
        error!("{}", Report::from_error(e));
        eprintln!("Try 'dicom-movescu --help' for more information.");
        std::process::exit(2);
    });

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap_or_else(|e| {
            error!("Could not start runtime: {}", Report::from_error(e));
            std::process::exit(2);
        });

    let outcome = run(&app, settings, Device::from_handle(runtime.handle().clone()));
    runtime.shutdown_background();

    if let Err(e) = outcome {
        error!("{}", Report::from_error(e));
        std::process::exit(2);
    }
}

fn selected_model(app: &App) -> Option<RetrieveModel> {
    [
        (app.patient_root, RetrieveModel::PatientRoot),
        (app.study_root, RetrieveModel::StudyRoot),
        (app.patient_study_only, RetrieveModel::PatientStudyOnly),
        (app.instance_root, RetrieveModel::CompositeInstanceRoot),
        (app.hanging_protocol, RetrieveModel::HangingProtocol),
        (app.color_palette, RetrieveModel::ColorPalette),
    ]
    .into_iter()
    .find_map(|(selected, model)| selected.then_some(model))
}

fn build_settings(app: &App) -> Result<RetrieveSettings, ConfigError> {
    let model = resolve(selected_model(app), app.level)?;
    let transfer_syntax =
        TransferSyntaxPolicy::select(app.explicit_vr, app.big_endian, app.implicit_vr)?;

    let mut options = MoveScuOptions::new()
        .remote(app.addr.as_str())
        .calling_ae_title(app.calling_ae_title.as_str())
        .max_pdu_length(app.max_pdu_length)
        .strict(app.strict)
        .model(model)
        .transfer_syntax(transfer_syntax)
        .relational_retrieve(app.relational)
        .priority(Priority::try_from(app.priority).unwrap_or_default());

    if let Some(level) = app.level {
        options = options.level(level);
    }
    if let Some(called_ae_title) = &app.called_ae_title {
        options = options.called_ae_title(called_ae_title.as_str());
    }
    if let Some(dest) = &app.dest {
        options = options.destination(dest.as_str());
    }
    if let Some(rsp_timeout) = app.rsp_timeout {
        options = options.rsp_timeout(Duration::from_millis(rsp_timeout));
    }
    if let Some(query_file) = &app.query_file {
        options = options.query_file(query_file)?;
    }
    options.keys(&app.keys)?.validate()
}

fn run(app: &App, settings: RetrieveSettings, device: Device) -> Result<(), Error> {
    info!(
        "Retrieving to '{}' from {} ({})",
        settings.destination(),
        app.addr,
        settings.model()
    );

    let mut session = AssociationSession::new(device, settings);
    session.open().context(OpenSnafu)?;

    let retrieved = retrieve_all(&mut session, app);
    let closed = session.close().context(CloseSnafu);
    retrieved.and(closed)
}

fn retrieve_all(session: &mut AssociationSession, app: &App) -> Result<(), Error> {
    if app.files.is_empty() {
        let label = "matching keys".to_string();
        let handler = response_handler(label.clone(), app.verbose);
        session
            .retrieve_keys(handler)
            .context(RetrieveSnafu { label })?;
        return Ok(());
    }

    for file in &app.files {
        let label = file.display().to_string();
        let handler = response_handler(label.clone(), app.verbose);
        session
            .retrieve_file(file, handler)
            .context(RetrieveSnafu { label })?;
    }
    Ok(())
}

/// Build the handler reporting the progress and outcome
/// of one retrieve operation.
fn response_handler(label: String, verbose: bool) -> impl FnMut(&MoveResponse) + Send + 'static {
    let progress_bar = if verbose {
        None
    } else {
        let pb = ProgressBar::new(0);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("[{elapsed_precise}] {bar:40} {pos}/{len} {wide_msg}")
                .expect("Invalid progress bar template"),
        );
        pb.set_message(label.clone());
        Some(pb)
    };

    move |rsp: &MoveResponse| {
        if verbose {
            eprintln!("Response #{} command:", rsp.message_id());
            if let Err(e) = DumpOptions::new().dump_object_to(stderr(), rsp.command()) {
                warn!("Could not dump response: {}", e);
            }
        }

        let done = [rsp.completed(), rsp.failed(), rsp.warning()]
            .into_iter()
            .flatten()
            .map(u64::from)
            .sum::<u64>();

        if !rsp.is_final() {
            debug!(
                "{}: pending, {} remaining, {} completed, {} failed, {} warning",
                label,
                rsp.remaining().unwrap_or(0),
                rsp.completed().unwrap_or(0),
                rsp.failed().unwrap_or(0),
                rsp.warning().unwrap_or(0),
            );
            if let Some(pb) = &progress_bar {
                pb.set_length(done + u64::from(rsp.remaining().unwrap_or(0)));
                pb.set_position(done);
            }
            return;
        }

        if let Some(pb) = &progress_bar {
            pb.finish_and_clear();
        }

        let status = rsp.status_code();
        let summary = format!(
            "{} completed, {} failed, {} warning",
            rsp.completed().unwrap_or(0),
            rsp.failed().unwrap_or(0),
            rsp.warning().unwrap_or(0),
        );
        match rsp.status() {
            MoveStatus::Success => info!("{}: retrieve complete ({})", label, summary),
            MoveStatus::Warning | MoveStatus::Cancel => warn!(
                "{}: {} (status code {:04X}H; {})",
                label,
                status_description(status),
                status,
                summary
            ),
            MoveStatus::Failure | MoveStatus::Pending => warn!(
                "{}: operation failed: {} (status code {:04X}H; {})",
                label,
                status_description(status),
                status,
                summary
            ),
        }
        if let Some(comment) = rsp.error_comment() {
            warn!("{}: {}", label, comment);
        }
        for uid in rsp.failed_sop_instances() {
            warn!("{}: failed SOP instance {}", label, uid);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli() {
        App::command().debug_assert();
    }

    #[test]
    fn cli_to_settings() {
        let app = App::parse_from([
            "dicom-movescu",
            "-S",
            "-L",
            "STUDY",
            "--dest",
            "STORESCP",
            "-m",
            "StudyInstanceUID=1.2.3",
            "--priority",
            "1",
            "QR-SCP@127.0.0.1:11112",
        ]);
        let settings = build_settings(&app).unwrap();
        assert_eq!(settings.model(), RetrieveModel::StudyRoot);
        assert_eq!(settings.priority(), Priority::High);
        assert_eq!(settings.destination(), "STORESCP");
        assert_eq!(settings.remote(), "QR-SCP@127.0.0.1:11112");
    }

    #[test]
    fn cli_config_errors() {
        let app = App::parse_from(["dicom-movescu", "-L", "STUDY", "--dest", "X", "127.0.0.1:104"]);
        assert!(matches!(build_settings(&app), Err(ConfigError::MissingModel)));

        let app = App::parse_from(["dicom-movescu", "-S", "-L", "STUDY", "127.0.0.1:104"]);
        assert!(matches!(
            build_settings(&app),
            Err(ConfigError::MissingDestination)
        ));

        let app = App::parse_from(["dicom-movescu", "-H", "-L", "STUDY", "--dest", "X", "127.0.0.1:104"]);
        assert!(matches!(
            build_settings(&app),
            Err(ConfigError::InvalidLevel { .. })
        ));

        assert!(App::try_parse_from(["dicom-movescu", "-S", "-P", "127.0.0.1:104"]).is_err());
        assert!(App::try_parse_from([
            "dicom-movescu",
            "--explicit-vr",
            "--big-endian",
            "127.0.0.1:104"
        ])
        .is_err());
    }
}
