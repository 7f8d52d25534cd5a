use cellstream::client::{Delegate, SandboxClient};
use cellstream::config::{Config, EngineConfig};
use cellstream::server::serve_tcp;
use std::net::TcpListener;
use std::sync::Arc;
use std::thread;

struct FixedAnswer {
    answer: String,
    notices: Vec<String>,
}

impl FixedAnswer {
    fn new(answer: &str) -> Self {
        Self {
            answer: answer.to_string(),
            notices: Vec::new(),
        }
    }
}

impl Delegate for FixedAnswer {
    fn ask(&mut self, _prompt: &str) -> Result<String, String> {
        Ok(self.answer.clone())
    }

    fn notice(&mut self, message: &str) {
        self.notices.push(message.to_string());
    }
}

fn start_server(engine: EngineConfig) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let config = Arc::new(Config {
        engine,
        ..Config::default()
    });
    thread::spawn(move || serve_tcp(listener, config));
    addr
}

#[test]
fn test_script_cell_over_tcp() {
    let addr = start_server(EngineConfig::default());
    let mut client = SandboxClient::connect(&addr).unwrap();
    let mut delegate = FixedAnswer::new("Ada");

    let result = client
        .run_cell(
            "notice \"starting\"\nlet name = ask(\"name?\")\nprint \"hello \" + name",
            &mut delegate,
        )
        .unwrap();
    assert!(result.success);
    assert_eq!(result.stdout, "hello Ada\n");
    assert_eq!(result.output, "hello Ada\n");
    assert_eq!(delegate.notices, vec!["starting".to_string()]);
}

#[test]
fn test_connections_do_not_share_sessions() {
    let addr = start_server(EngineConfig::default());
    let mut first = SandboxClient::connect(&addr).unwrap();
    let mut second = SandboxClient::connect(&addr).unwrap();
    let mut delegate = FixedAnswer::new("");

    let result = first.run_cell("let secret = 1", &mut delegate).unwrap();
    assert!(result.success);

    let result = second.run_cell("secret", &mut delegate).unwrap();
    assert!(!result.success);
    assert!(result.stderr.contains("'secret' is not defined"));

    // The first connection still sees its own binding.
    let result = first.run_cell("secret + 1", &mut delegate).unwrap();
    assert_eq!(result.stdout, "2\n");
}

#[test]
fn test_sequential_cells_on_one_connection() {
    let addr = start_server(EngineConfig::default());
    let mut client = SandboxClient::connect(&addr).unwrap();
    let mut delegate = FixedAnswer::new("x");

    for i in 0..5 {
        let result = client.run_cell(&format!("{} * 3", i), &mut delegate).unwrap();
        assert_eq!(result.stdout, format!("{}\n", i * 3));
    }
}

#[test]
fn test_shell_engine_over_tcp() {
    let addr = start_server(EngineConfig {
        kind: "shell".to_string(),
        ..EngineConfig::default()
    });
    let mut client = SandboxClient::connect(&addr).unwrap();
    let mut delegate = FixedAnswer::new("Ada");

    let result = client
        .run_cell(
            "echo '::notice::hi'; echo '::ask::name?'; read n; echo \"hi $n\"; echo warn >&2",
            &mut delegate,
        )
        .unwrap();
    assert!(result.success);
    assert_eq!(result.stdout, "hi Ada\n");
    assert_eq!(result.stderr, "warn\n");
    assert_eq!(delegate.notices, vec!["hi".to_string()]);

    let result = client.run_cell("exit 3", &mut delegate).unwrap();
    assert!(!result.success);
}
