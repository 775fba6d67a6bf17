//! rpc-probe
//!
//! Lists the endpoint mapper registrations of a Windows host, or resolves a
//! single interface to its endpoint.
//!
//! USAGE:
//!   rpc-probe [OPTIONS] <TARGET>
//!
//! EXAMPLES:
//!   rpc-probe corp.local/alice:S3cret --dc-ip 10.0.0.5
//!   rpc-probe corp.local/alice --hashes :31d6cfe0d16ae931b73c59d7e0c089c0 --dc-host dc01
//!   rpc-probe corp.local/alice -k --no-pass            # probes the DC's FQDN first
//!   rpc-probe corp.local/ --dc-ip 10.0.0.5 --interface 12345778-1234-abcd-ef00-0123456789ab --resolve

use clap::Parser;
use dcerpc_session::epm::epm_descriptor;
use dcerpc_session::{
    probe_machine_name, CredentialOptions, CredentialResolver, Credentials, EndpointResolver,
    EpmEntry, EpmLookupCodec, EpmMapper, PagedQuery, SessionBuilder, SessionConfig, SessionError,
    ServiceDescriptor, SyntaxId, TargetAddress, TcpTransport, TransportFamily, Uuid, NDR_SYNTAX,
};
use std::error::Error;
use std::process::ExitCode;
use tracing::{debug, error, info, Level};
use tracing_subscriber::FmtSubscriber;

const COLUMNS: [(&str, usize); 4] = [
    ("Protocol", 15),
    ("Endpoint", 35),
    ("Interface", 45),
    ("Annotation", 40),
];

#[derive(Parser, Debug)]
#[command(name = "rpc-probe")]
#[command(version)]
#[command(about = "List endpoint mapper registrations over an anonymous DCE/RPC session")]
#[command(long_about = "List endpoint mapper registrations over an anonymous DCE/RPC session.

The endpoint mapper is always queried anonymously. Credentials, hashes and \
keys only pick the target host and, with -k and no --dc-host, drive the \
machine-name lookup of the domain controller. No password is prompted for; \
give one in TARGET or pass --no-pass.")]
struct Args {
    /// domain[/username[:password]]
    #[arg(value_name = "TARGET")]
    target: String,

    /// NTLM hashes, format is LMHASH:NTHASH
    #[arg(long, value_name = "LMHASH:NTHASH")]
    hashes: Option<String>,

    /// Proceed without a password (useful for -k)
    #[arg(long)]
    no_pass: bool,

    /// Use Kerberos authentication
    #[arg(short = 'k')]
    kerberos: bool,

    /// AES key to use for Kerberos authentication (128 or 256 bits)
    #[arg(long = "aesKey", value_name = "HEX KEY")]
    aes_key: Option<String>,

    /// IP address of the domain controller
    #[arg(long, value_name = "IP ADDRESS")]
    dc_ip: Option<String>,

    /// Hostname of the domain controller; required for Kerberos against an IP
    #[arg(long, value_name = "HOSTNAME")]
    dc_host: Option<String>,

    /// Only list registrations of this interface UUID
    #[arg(long, value_name = "UUID")]
    interface: Option<String>,

    /// With --interface: resolve it with ept_map instead of listing
    #[arg(long, requires = "interface")]
    resolve: bool,

    /// Interface version for --resolve, as MAJOR.MINOR
    #[arg(long, default_value = "1.0", value_name = "MAJOR.MINOR")]
    interface_version: String,

    /// Entries requested per ept_lookup page
    #[arg(long, default_value_t = 50)]
    page_size: u32,

    /// Endpoint mapper port
    #[arg(long, default_value_t = dcerpc_session::EPM_PORT)]
    port: u16,

    /// Connect timeout in seconds
    #[arg(long, default_value_t = 10)]
    timeout: u64,

    /// Turn DEBUG output ON
    #[arg(long)]
    debug: bool,

    /// Adds timestamp to every logging output
    #[arg(long)]
    ts: bool,
}

fn init_logging(args: &Args) {
    let level = if args.debug { Level::DEBUG } else { Level::INFO };
    let builder = FmtSubscriber::builder().with_max_level(level).with_target(false);
    let result = if args.ts {
        tracing::subscriber::set_global_default(builder.finish())
    } else {
        tracing::subscriber::set_global_default(builder.without_time().finish())
    };
    if let Err(e) = result {
        eprintln!("failed to install logger: {}", e);
    }
}

/// Error message, with the full source chain when debugging.
fn describe(err: &SessionError, verbose: bool) -> String {
    let mut message = err.to_string();
    if verbose {
        let mut source = err.source();
        while let Some(cause) = source {
            message.push_str(&format!("\n  caused by: {}", cause));
            source = cause.source();
        }
    }
    message
}

fn credential_options(args: &Args) -> CredentialOptions {
    CredentialOptions {
        hashes: args.hashes.clone(),
        aes_key: args.aes_key.clone(),
        no_pass: args.no_pass,
        kerberos: args.kerberos,
        dc_ip: args.dc_ip.clone(),
        dc_host: args.dc_host.clone(),
    }
}

fn session_config(args: &Args) -> SessionConfig {
    SessionConfig::default()
        .with_connect_timeout(std::time::Duration::from_secs(args.timeout))
        .with_auth_level(dcerpc_session::AuthLevel::None)
}

/// Kerberos needs a host name; learn it from the target when only an
/// address or the domain was given.
async fn select_target(args: &Args, credentials: Credentials) -> Result<Credentials, SessionError> {
    if !credentials.use_kerberos() || credentials.kdc().dc_host.is_some() {
        return Ok(credentials);
    }
    let address = TargetAddress::tcp(credentials.target_host(), args.port);
    info!("Probing {} for its machine name", address);
    let names = probe_machine_name(&TcpTransport::new(), &address, &session_config(args))
        .await
        .map_err(|e| {
            error!(
                "Could not learn the machine name of {}; pass its NetBIOS name or FQDN with --dc-host",
                credentials.target_host()
            );
            e
        })?;
    match names.canonical() {
        Some(name) => {
            info!("Using {} as the target host", name);
            Ok(credentials.with_dc_host(name))
        }
        None => Err(SessionError::InvalidInput(format!(
            "{} did not report a machine name; pass it with --dc-host",
            credentials.target_host()
        ))),
    }
}

fn parse_version(spec: &str) -> Result<(u16, u16), SessionError> {
    let invalid = || SessionError::InvalidInput(format!("invalid interface version '{}'", spec));
    let (major, minor) = spec.split_once('.').unwrap_or((spec, "0"));
    Ok((
        major.parse().map_err(|_| invalid())?,
        minor.parse().map_err(|_| invalid())?,
    ))
}

fn format_row(cells: [&str; 4]) -> String {
    let line: Vec<String> = cells
        .iter()
        .zip(COLUMNS)
        .map(|(cell, (_, width))| format!("{:<width$}", cell, width = width))
        .collect();
    line.join("  ").trim_end().to_string()
}

fn print_header() {
    println!("{}", format_row(COLUMNS.map(|(name, _)| name)));
    let rule: Vec<String> = COLUMNS.iter().map(|(_, width)| "-".repeat(*width)).collect();
    println!("{}", rule.join("  "));
}

fn entry_row(entry: &EpmEntry) -> [String; 4] {
    [
        entry.tower.protocol_sequence().unwrap_or("unknown").to_string(),
        entry.binding(),
        entry
            .interface()
            .map(|i| i.to_string())
            .unwrap_or_else(|| "-".into()),
        entry.annotation.clone(),
    ]
}

async fn resolve(args: &Args, host: &str, uuid: Uuid) -> Result<(), SessionError> {
    let (major, minor) = parse_version(&args.interface_version)?;
    let descriptor = ServiceDescriptor::builder(TransportFamily::Tcp)
        .alternative(SyntaxId::new(uuid, major, minor), NDR_SYNTAX)
        .build()?;
    let mapper = EpmMapper::new(TcpTransport::new())
        .with_config(session_config(args))
        .with_port(args.port);
    let address = EndpointResolver::new(host, mapper).resolve(&descriptor).await?;
    println!("{}", address);
    Ok(())
}

async fn list(args: &Args, host: &str) -> Result<(), SessionError> {
    let mut session = SessionBuilder::new(epm_descriptor()?, Credentials::anonymous())
        .config(session_config(args))
        .connect(TargetAddress::tcp(host, args.port))
        .await?;

    let query = PagedQuery::new(args.interface.clone().unwrap_or_default(), args.page_size);
    print_header();
    let result = session
        .paged_query(&EpmLookupCodec, &query, |entry| {
            let row = entry_row(&entry);
            println!("{}", format_row([&row[0], &row[1], &row[2], &row[3]]));
            Ok(())
        })
        .await;
    session.close().await;
    let summary = result?;

    info!(
        "{} registration(s) in {} page(s), {} skipped",
        summary.delivered, summary.pages, summary.skipped
    );
    Ok(())
}

async fn run(args: &Args) -> Result<(), SessionError> {
    let credentials = CredentialResolver::resolve(&args.target, &credential_options(args))?;
    let credentials = select_target(args, credentials).await?;
    let host = credentials.target_host().to_string();
    debug!("credentials: {:?}", credentials);

    match (&args.interface, args.resolve) {
        (Some(interface), true) => resolve(args, &host, interface.parse()?).await,
        _ => list(args, &host).await,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(&args);

    match run(&args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", describe(&e, args.debug));
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_parse_version() {
        assert_eq!(parse_version("3.0").unwrap(), (3, 0));
        assert_eq!(parse_version("2").unwrap(), (2, 0));
        assert!(parse_version("x.1").is_err());
    }

    #[test]
    fn test_args_map_to_credential_options() {
        let args = Args::parse_from([
            "rpc-probe",
            "corp.local/alice",
            "--aesKey",
            "00112233445566778899aabbccddeeff",
            "--dc-ip",
            "10.0.0.5",
        ]);
        let credentials = CredentialResolver::resolve(&args.target, &credential_options(&args)).unwrap();
        assert!(credentials.use_kerberos());
        assert_eq!(credentials.target_host(), "10.0.0.5");
    }

    #[test]
    fn test_missing_domain_is_rejected() {
        let args = Args::parse_from(["rpc-probe", "alice"]);
        let err = CredentialResolver::resolve(&args.target, &credential_options(&args)).unwrap_err();
        assert!(err.to_string().contains("domain"));
    }

    #[test]
    fn test_help_states_listing_is_anonymous() {
        let help = Args::command().render_long_help().to_string();
        assert!(help.contains("always queried anonymously"));
        assert!(help.contains("No password is prompted for"));
    }

    #[test]
    fn test_rows_align_to_columns() {
        let row = format_row(["ncacn_ip_tcp", "ncacn_ip_tcp:10.0.0.5[49667]", "-", ""]);
        assert_eq!(row.find("ncacn_ip_tcp:"), Some(15 + 2));
        assert_eq!(row.find('-'), Some(15 + 2 + 35 + 2));
        assert!(!row.ends_with(' '));
    }
}
