#![forbid(unsafe_code)]

use anyhow::{Result, anyhow};
use clap::Parser;
use fs_mistrust::Mistrust;
use lazy_static::lazy_static;
use log::{info, error, LevelFilter};
use serde::Deserialize;
use std::os::unix::fs::PermissionsExt;
use std::{env, fs, path::Path};

use log4rs::append::console::ConsoleAppender;
use log4rs::config::{Appender, Config as LogConfig, Root};
use log4rs::encode::pattern::PatternEncoder;

// Server Utilities
use crate::utils::errors::Errors;
use crate::utils::server_utils::get_absolute_path;

// ***************************************************************************
//                                Constants
// ***************************************************************************
// Directory and file locations. Unless otherwise noted, all files and directories
// are relative to the root directory.
const ENV_ROOT_DIR         : &str = "MASTER_SERVER_ROOT_DIR";
const DEFAULT_ROOT_DIR     : &str = "~/.master_server";
const CONFIG_DIR           : &str = "/config";
const LOGS_DIR             : &str = "/logs";
const CERTS_DIR            : &str = "/certs";
const LOG4RS_CONFIG_FILE   : &str = "/log4rs.yml";          // relative to config dir
const SERVER_CONFIG_FILE   : &str = "/master_server.toml";  // relative to config dir
const TLS_KEY_FILE         : &str = "/key.pem";             // relative to certs dir
const TLS_CERT_FILE        : &str = "/cert.pem";            // relative to certs dir

// Networking.
const DEFAULT_HTTP_ADDR    : &str = "http://localhost";
const DEFAULT_HTTP_PORT    : u16  = 5000;

// Console logging used when no log4rs file has been installed.
const FALLBACK_LOG_PATTERN : &str = "{d(%Y-%m-%dT%H:%M:%S%.3f)} {h({l})} {M} - {m}{n}";

// ***************************************************************************
//                             Static Variables
// ***************************************************************************
// Parse the command line once; clap exits the process on bad arguments.
lazy_static! {
    pub static ref SERVER_ARGS: ServerArgs = ServerArgs::parse();
}

// ***************************************************************************
//                             Directory Structs
// ***************************************************************************
// ---------------------------------------------------------------------------
// ServerDirs:
// ---------------------------------------------------------------------------
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerDirs {
    pub root_dir: String,
    pub config_dir: String,
    pub logs_dir: String,
    pub certs_dir: String,
}

impl ServerDirs {
    /// Lay out the data directories under an absolute root.
    pub fn new(root_dir: &str) -> Self {
        Self {
            root_dir: root_dir.to_string(),
            config_dir: root_dir.to_string() + CONFIG_DIR,
            logs_dir: root_dir.to_string() + LOGS_DIR,
            certs_dir: root_dir.to_string() + CERTS_DIR,
        }
    }

    pub fn log_config_file(&self) -> String {
        self.config_dir.clone() + LOG4RS_CONFIG_FILE
    }

    pub fn server_config_file(&self) -> String {
        self.config_dir.clone() + SERVER_CONFIG_FILE
    }

    pub fn tls_key_file(&self) -> String {
        self.certs_dir.clone() + TLS_KEY_FILE
    }

    pub fn tls_cert_file(&self) -> String {
        self.certs_dir.clone() + TLS_CERT_FILE
    }
}

// ***************************************************************************
//                               Config Structs
// ***************************************************************************
// ---------------------------------------------------------------------------
// ServerArgs:
// ---------------------------------------------------------------------------
#[derive(Debug, Parser)]
#[command(name = "master_server", version, about = "Command line arguments for the Master Server.")]
pub struct ServerArgs {
    /// Specify the server's root data directory.
    ///
    /// This directory contains all the files the server uses during execution.
    #[arg(short, long)]
    pub root_dir: Option<String>,

    /// Create the data directories and then exit.
    ///
    /// The data directories will be rooted at a root directory calculated
    /// using the following priority order:
    ///
    ///   1. If set, the value of the MASTER_SERVER_ROOT_DIR environment,
    ///
    ///   2. Otherwise, if set, the value of the --root-dir command line argument,
    ///
    ///   3. Otherwise, ~/.master_server
    ///
    #[arg(short, long)]
    pub create_dirs_only: bool,
}

// ---------------------------------------------------------------------------
// Parms:
// ---------------------------------------------------------------------------
#[derive(Debug)]
#[allow(dead_code)]
pub struct Parms {
    pub config_file: String,
    pub config: Config,
}

// ---------------------------------------------------------------------------
// RuntimeCtx:
// ---------------------------------------------------------------------------
#[derive(Debug)]
#[allow(dead_code)]
pub struct RuntimeCtx {
    pub parms: Parms,
    pub server_args: &'static ServerArgs,
    pub server_dirs: ServerDirs,
}

// ---------------------------------------------------------------------------
// Config:
// ---------------------------------------------------------------------------
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    pub title: String,
    pub http_addr: String,
    pub http_port: u16,
    pub enable_tls: bool,
    pub enable_swagger: bool,
}

impl Config {
    pub fn new() -> Self {
        Config::default()
    }

    /// The externally visible base URL of the api, used in the openapi document.
    pub fn api_url(&self) -> String {
        format!("{}:{}{}", self.http_addr, self.http_port, crate::API_PREFIX)
    }

    /// The address the listener binds to.
    pub fn bind_addr(&self) -> String {
        format!("0.0.0.0:{}", self.http_port)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            title: "Master Server".to_string(),
            http_addr: DEFAULT_HTTP_ADDR.to_string(),
            http_port: DEFAULT_HTTP_PORT,
            enable_tls: false,
            enable_swagger: true,
        }
    }
}

// ***************************************************************************
//                            Directory Functions
// ***************************************************************************
// ---------------------------------------------------------------------------
// init_server_dirs:
// ---------------------------------------------------------------------------
/** Calculate the external data directories, creating any that are missing. */
pub fn init_server_dirs(args: &ServerArgs) -> Result<ServerDirs> {
    let mistrust = get_mistrust()?;

    let root_dir = resolve_root_dir(env::var(ENV_ROOT_DIR).ok(), args.root_dir.clone());
    let dirs = ServerDirs::new(&root_dir);

    // Check that each path is absolute and is a directory with the
    // proper permission assigned if it exists.  If it doesn't exist,
    // create it.
    check_server_dir(&dirs.root_dir, "root directory", &mistrust)?;
    check_server_dir(&dirs.config_dir, "config directory", &mistrust)?;
    check_server_dir(&dirs.logs_dir, "logs directory", &mistrust)?;
    check_server_dir(&dirs.certs_dir, "certs directory", &mistrust)?;

    Ok(dirs)
}

// ---------------------------------------------------------------------------
// resolve_root_dir:
// ---------------------------------------------------------------------------
/** Order of precedence:
 *  1. Environment variable
 *  2. Command line --root-dir argument
 *  3. Default location
 *
 * The result is expanded and made absolute.
 */
fn resolve_root_dir(env_root: Option<String>, arg_root: Option<String>) -> String {
    let root_dir = env_root
        .or(arg_root)
        .unwrap_or_else(|| DEFAULT_ROOT_DIR.to_string());
    get_absolute_path(&root_dir)
}

// ---------------------------------------------------------------------------
// check_server_dir:
// ---------------------------------------------------------------------------
/** Check that the path is absolute and, if it exists, that it has the proper
 * permissions assigned.  If it doesn't exist, create it.  The mistrust package
 * creates directories with 0o700 permissions.
 */
fn check_server_dir(dir: &str, msgname: &str, mistrust: &Mistrust) -> Result<()> {
    let path = Path::new(dir);
    if !path.is_absolute() {
        return Err(dir_error(format!("The {} path must be absolute: {}", msgname, dir)));
    }

    if path.exists() {
        if !path.is_dir() {
            return Err(dir_error(format!("The {} path must be a directory: {}", msgname, dir)));
        }

        // Make sure the directory has rwx for owner only.
        let perm = path.metadata()?.permissions().mode();
        if perm & 0o777 != 0o700 {
            return Err(dir_error(format!("The {} path must have 0o700 permissions: {}", msgname, dir)));
        }
    } else if let Err(e) = mistrust.make_directory(path) {
        return Err(dir_error(format!("Make directory error for {}: {}", dir, e)));
    }

    Ok(())
}

fn dir_error(msg: String) -> anyhow::Error {
    anyhow!(Errors::DirectoryError(msg))
}

// ---------------------------------------------------------------------------
// get_mistrust:
// ---------------------------------------------------------------------------
/** Configure a new mistrust object for initial directory processing. */
fn get_mistrust() -> Result<Mistrust> {
    Mistrust::builder()
        .ignore_prefix(get_absolute_path("~"))
        .trust_group(0)
        .build()
        .map_err(|e| anyhow!("Mistrust configuration error: {}", e))
}

// ***************************************************************************
//                               Log Functions
// ***************************************************************************
// ---------------------------------------------------------------------------
// init_log:
// ---------------------------------------------------------------------------
/** Initialize log4rs from the config directory's log4rs.yml.  When no such
 * file exists, log to the console at info level.
 */
pub fn init_log(dirs: &ServerDirs) -> Result<()> {
    let logconfig = dirs.log_config_file();
    if Path::new(&logconfig).exists() {
        if let Err(e) = log4rs::init_file(&logconfig, Default::default()) {
            eprintln!("{}", e);
            return Err(anyhow!(Errors::Log4rsInitialization(logconfig)));
        }
        info!("Log4rs initialized using: {}", logconfig);
    } else {
        log4rs::init_config(fallback_log_config()?)?;
        info!("Log4rs initialized with console logging, no file found at: {}", logconfig);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// fallback_log_config:
// ---------------------------------------------------------------------------
fn fallback_log_config() -> Result<LogConfig> {
    let stdout = ConsoleAppender::builder()
        .encoder(Box::new(PatternEncoder::new(FALLBACK_LOG_PATTERN)))
        .build();
    let config = LogConfig::builder()
        .appender(Appender::builder().build("stdout", Box::new(stdout)))
        .build(Root::builder().appender("stdout").build(LevelFilter::Info))?;
    Ok(config)
}

// ***************************************************************************
//                             Parms Functions
// ***************************************************************************
// ---------------------------------------------------------------------------
// get_parms:
// ---------------------------------------------------------------------------
/** Retrieve the application parameters from the configuration file in the
 * config directory.  A missing file means all defaults are used.
 */
fn get_parms(config_file: &str) -> Result<Parms> {
    let config_file_abs = get_absolute_path(config_file);
    info!("{}", Errors::ReadingConfigFile(config_file_abs.clone()));
    let contents = match fs::read_to_string(&config_file_abs) {
        Ok(c) => c,
        Err(_) => {
            info!("Unable to read configuration at {}. Using default values.", config_file_abs);
            return Ok(Parms { config_file: Default::default(), config: Config::new() });
        }
    };

    let config = parse_config(&contents, &config_file_abs)?;
    Ok(Parms { config_file: config_file_abs, config })
}

// ---------------------------------------------------------------------------
// parse_config:
// ---------------------------------------------------------------------------
fn parse_config(contents: &str, config_file: &str) -> Result<Config> {
    match toml::from_str(contents) {
        Ok(c) => Ok(c),
        Err(e) => {
            let msg = format!("{}\n   {}", Errors::TOMLParseError(config_file.to_string()), e);
            error!("{}", msg);
            Err(anyhow!(msg))
        }
    }
}

// ***************************************************************************
//                             Config Functions
// ***************************************************************************
// ---------------------------------------------------------------------------
// init_runtime_context:
// ---------------------------------------------------------------------------
pub fn init_runtime_context(server_dirs: ServerDirs) -> Result<RuntimeCtx> {
    let parms = get_parms(&server_dirs.server_config_file())?;
    Ok(RuntimeCtx { parms, server_args: &SERVER_ARGS, server_dirs })
}

// ***************************************************************************
//                                  Tests
// ***************************************************************************
#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{self, DirBuilder};
    use std::os::unix::fs::DirBuilderExt;
    use std::path::PathBuf;

    // Unique scratch location under the system temp directory.
    fn scratch(name: &str) -> PathBuf {
        let p = env::temp_dir().join(format!("master_server_{}_{}", name, std::process::id()));
        let _ = fs::remove_dir_all(&p);
        p
    }

    #[test]
    fn default_config() {
        let c = Config::new();
        assert_eq!(c.title, "Master Server");
        assert_eq!(c.http_port, 5000);
        assert!(!c.enable_tls);
        assert!(c.enable_swagger);
        assert_eq!(c.api_url(), "http://localhost:5000/api");
        assert_eq!(c.bind_addr(), "0.0.0.0:5000");
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let c = parse_config("http_port = 8080\nenable_swagger = false\n", "test.toml").unwrap();
        assert_eq!(c.http_port, 8080);
        assert!(!c.enable_swagger);
        assert_eq!(c.http_addr, DEFAULT_HTTP_ADDR);
        assert_eq!(c.title, "Master Server");
    }

    #[test]
    fn bad_toml_is_rejected() {
        let e = parse_config("http_port = \"not a port\"", "bad.toml").unwrap_err();
        assert!(e.to_string().contains("Unable to parse TOML file: bad.toml"));
    }

    #[test]
    fn missing_config_file_uses_defaults() {
        let dir = scratch("missing_cfg");
        let file = dir.join("master_server.toml");
        let parms = get_parms(file.to_str().unwrap()).unwrap();
        assert_eq!(parms.config, Config::default());
        assert!(parms.config_file.is_empty());
    }

    #[test]
    fn config_file_is_read() {
        let dir = scratch("read_cfg");
        fs::create_dir_all(&dir).unwrap();
        let file = dir.join("master_server.toml");
        fs::write(&file, "title = \"Lobby\"\nhttp_port = 7001\n").unwrap();

        let parms = get_parms(file.to_str().unwrap()).unwrap();
        assert_eq!(parms.config.title, "Lobby");
        assert_eq!(parms.config.http_port, 7001);
        assert_eq!(parms.config_file, file.to_str().unwrap());
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn root_dir_precedence() {
        let env_root = Some("/env/root".to_string());
        let arg_root = Some("/arg/root".to_string());
        assert_eq!(resolve_root_dir(env_root, arg_root.clone()), "/env/root");
        assert_eq!(resolve_root_dir(None, arg_root), "/arg/root");
        assert_eq!(resolve_root_dir(None, None), get_absolute_path(DEFAULT_ROOT_DIR));
    }

    #[test]
    fn dir_layout() {
        let dirs = ServerDirs::new("/srv/ms");
        assert_eq!(dirs.config_dir, "/srv/ms/config");
        assert_eq!(dirs.logs_dir, "/srv/ms/logs");
        assert_eq!(dirs.certs_dir, "/srv/ms/certs");
        assert_eq!(dirs.log_config_file(), "/srv/ms/config/log4rs.yml");
        assert_eq!(dirs.server_config_file(), "/srv/ms/config/master_server.toml");
        assert_eq!(dirs.tls_key_file(), "/srv/ms/certs/key.pem");
        assert_eq!(dirs.tls_cert_file(), "/srv/ms/certs/cert.pem");
    }

    #[test]
    fn relative_dir_is_rejected() {
        let mistrust = get_mistrust().unwrap();
        let e = check_server_dir("relative/dir", "root directory", &mistrust).unwrap_err();
        assert!(e.to_string().contains("must be absolute"));
    }

    #[test]
    fn dir_permissions_are_checked() {
        let mistrust = get_mistrust().unwrap();

        let private = scratch("private");
        DirBuilder::new().mode(0o700).create(&private).unwrap();
        assert!(check_server_dir(private.to_str().unwrap(), "root directory", &mistrust).is_ok());

        let open = scratch("open");
        DirBuilder::new().mode(0o755).create(&open).unwrap();
        // The umask may strip bits, so force the mode.
        fs::set_permissions(&open, fs::Permissions::from_mode(0o755)).unwrap();
        let e = check_server_dir(open.to_str().unwrap(), "root directory", &mistrust).unwrap_err();
        assert!(e.to_string().contains("0o700"));

        fs::remove_dir_all(&private).unwrap();
        fs::remove_dir_all(&open).unwrap();
    }

    #[test]
    fn missing_dirs_are_created_private() {
        let mistrust = get_mistrust().unwrap();
        let root = scratch("created");
        let dirs = ServerDirs::new(root.to_str().unwrap());
        assert!(!root.exists());

        check_server_dir(&dirs.root_dir, "root directory", &mistrust).unwrap();
        check_server_dir(&dirs.config_dir, "config directory", &mistrust).unwrap();
        check_server_dir(&dirs.logs_dir, "logs directory", &mistrust).unwrap();
        check_server_dir(&dirs.certs_dir, "certs directory", &mistrust).unwrap();

        for d in [&dirs.root_dir, &dirs.config_dir, &dirs.logs_dir, &dirs.certs_dir] {
            let meta = fs::metadata(d).unwrap();
            assert!(meta.is_dir(), "{} is not a directory", d);
            assert_eq!(meta.permissions().mode() & 0o777, 0o700, "{} has wrong mode", d);
        }

        // A second pass accepts what the first one created.
        assert!(check_server_dir(&dirs.config_dir, "config directory", &mistrust).is_ok());
        fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn file_is_not_a_dir() {
        let mistrust = get_mistrust().unwrap();
        let dir = scratch("not_a_dir");
        fs::create_dir_all(&dir).unwrap();
        let file = dir.join("plain_file");
        fs::write(&file, "x").unwrap();

        let e = check_server_dir(file.to_str().unwrap(), "config directory", &mistrust).unwrap_err();
        assert!(e.to_string().contains("must be a directory"));
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn fallback_log_config_builds() {
        assert!(fallback_log_config().is_ok());
    }
}
