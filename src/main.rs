use cellstream::client::{Delegate, SandboxClient};
use cellstream::config::Config;
use cellstream::protocol::StreamKind;
use cellstream::server;
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::io::{Read, Write};
use std::net::TcpListener;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cellstream")]
#[command(about = "Sandboxed code execution where running code can ask the client questions.")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve sessions over TCP
    Serve {
        /// Address to listen on
        #[arg(short, long)]
        listen: Option<String>,
        /// Engine to run cells with (script or shell)
        #[arg(short, long)]
        engine: Option<String>,
    },
    /// Serve a single session over stdin/stdout
    Stdio {
        /// Engine to run cells with (script or shell)
        #[arg(short, long)]
        engine: Option<String>,
    },
    /// Run one cell against a server, answering its questions interactively
    Run {
        /// Server address
        #[arg(short, long)]
        connect: Option<String>,
        /// Read the cell from a file ("-" for stdin)
        #[arg(short, long, conflicts_with = "code")]
        file: Option<String>,
        /// Cell source
        code: Option<String>,
    },
    /// Show configuration
    Config,
}

/// Answers asks from the terminal and echoes output as it streams in.
struct ConsoleDelegate {
    editor: Option<rustyline::DefaultEditor>,
}

impl ConsoleDelegate {
    fn new() -> Self {
        let editor = match rustyline::DefaultEditor::new() {
            Ok(editor) => Some(editor),
            Err(e) => {
                tracing::warn!(error = %e, "line editor unavailable, reading answers from stdin");
                None
            }
        };
        Self { editor }
    }
}

impl Delegate for ConsoleDelegate {
    fn ask(&mut self, prompt: &str) -> Result<String, String> {
        let label = format!("{} {} ", "ask>".blue().bold(), prompt);
        match self.editor.as_mut() {
            Some(editor) => editor.readline(&label).map_err(|e| e.to_string()),
            None => {
                eprint!("{}", label);
                let mut line = String::new();
                std::io::stdin()
                    .read_line(&mut line)
                    .map_err(|e| e.to_string())?;
                Ok(line.trim_end_matches(['\n', '\r']).to_string())
            }
        }
    }

    fn notice(&mut self, message: &str) {
        eprintln!("{} {}", "notice>".yellow().bold(), message);
    }

    fn on_output(&mut self, text: &str, stream: StreamKind) {
        match stream {
            StreamKind::Stdout => {
                print!("{}", text);
                let _ = std::io::stdout().flush();
            }
            StreamKind::Stderr => eprint!("{}", text.red()),
        }
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn read_code(code: Option<String>, file: Option<String>) -> Result<String, String> {
    match (code, file) {
        (Some(code), _) => Ok(code),
        (None, Some(path)) if path == "-" => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .map_err(|e| format!("Failed to read stdin: {}", e))?;
            Ok(buf)
        }
        (None, Some(path)) => {
            std::fs::read_to_string(&path).map_err(|e| format!("Failed to read {}: {}", path, e))
        }
        (None, None) => Err("Nothing to run: pass CODE or --file".to_string()),
    }
}

fn run_cell(addr: &str, code: &str) -> Result<bool, String> {
    let mut client = SandboxClient::connect(addr).map_err(|e| e.to_string())?;
    let mut delegate = ConsoleDelegate::new();
    let result = client
        .run_cell(code, &mut delegate)
        .map_err(|e| e.to_string())?;
    if result.success {
        eprintln!("{}", "[ok]".green());
    } else {
        eprintln!("{}", "[failed]".red());
    }
    Ok(result.success)
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging();

    let mut cfg = Config::load();

    match cli.command {
        Commands::Serve { listen, engine } => {
            if let Some(listen) = listen {
                cfg.server.listen = listen;
            }
            if let Some(engine) = engine {
                cfg.engine.kind = engine;
            }
            let listener = match TcpListener::bind(&cfg.server.listen) {
                Ok(l) => l,
                Err(e) => {
                    eprintln!(
                        "{} Failed to listen on {}: {}",
                        "Error:".red(),
                        cfg.server.listen,
                        e
                    );
                    return ExitCode::FAILURE;
                }
            };
            if let Err(e) = server::serve_tcp(listener, Arc::new(cfg)) {
                eprintln!("{} {}", "Error:".red(), e);
                return ExitCode::FAILURE;
            }
        }
        Commands::Stdio { engine } => {
            if let Some(engine) = engine {
                cfg.engine.kind = engine;
            }
            if let Err(e) = server::serve_stdio(&cfg) {
                eprintln!("{} {}", "Error:".red(), e);
                return ExitCode::FAILURE;
            }
        }
        Commands::Run {
            connect,
            file,
            code,
        } => {
            let addr = connect.unwrap_or_else(|| cfg.server.listen.clone());
            let outcome = read_code(code, file).and_then(|code| run_cell(&addr, &code));
            match outcome {
                Ok(true) => {}
                Ok(false) => return ExitCode::FAILURE,
                Err(e) => {
                    eprintln!("{} {}", "Error:".red(), e);
                    return ExitCode::FAILURE;
                }
            }
        }
        Commands::Config => {
            println!("{}", "Current configuration:".bold());
            println!();
            match cfg.to_toml() {
                Ok(s) => println!("{}", s),
                Err(e) => eprintln!("Error serializing config: {}", e),
            }
        }
    }

    ExitCode::SUCCESS
}
