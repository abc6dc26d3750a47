//! The plugin serve loop: handshake, request dispatch, process hygiene.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};

use plugtab_common::protocol::{
    self, COOKIE_KEY, COOKIE_VALUE, PROTOCOL_VERSION, Request, Response,
};
use plugtab_common::{PlugError, PluginManifest, Result};
use tracing::{debug, error, info};

use crate::endpoint::Endpoint;
use crate::TableCreator;

/// At most one plugin definition may be served per process; the RPC session
/// assumes it owns stdin/stdout exclusively.
static SERVED: AtomicBool = AtomicBool::new(false);

/// A plugin definition: registered tables plus the serve entry point.
pub struct Plugin {
    endpoint: Endpoint,
}

impl Plugin {
    pub fn new() -> Self {
        Self {
            endpoint: Endpoint::new(),
        }
    }

    /// Register a table creator under a manifest index.
    pub fn register<F>(&mut self, table_index: usize, creator: F) -> Result<()>
    where
        F: Fn(crate::TableCreatorArgs) -> Result<(Box<dyn crate::Table>, plugtab_common::TableDescriptor)>
            + Send
            + 'static,
    {
        if SERVED.load(Ordering::SeqCst) {
            return Err(PlugError::Config(
                "plugin is already served, tables can no longer be registered".into(),
            ));
        }
        self.endpoint.register(table_index, Box::new(creator) as TableCreator)
    }

    /// The manifest this plugin would report during a handshake.
    pub fn manifest(&self) -> PluginManifest {
        PluginManifest {
            protocol_version: PROTOCOL_VERSION,
            cookie_key: COOKIE_KEY.to_string(),
            cookie_value: COOKIE_VALUE.to_string(),
            tables: self.endpoint.table_indices(),
        }
    }

    /// Start serving on stdin/stdout. Returns once the host closes the
    /// channel or sends `Shutdown`.
    ///
    /// Fails if called twice in one process, or when the process was not
    /// launched by a compatible host (the cookie environment variable is
    /// how a host identifies itself; a human running the binary by hand
    /// gets a clear message instead of a silent hang on stdin).
    pub fn serve(&self) -> Result<()> {
        if SERVED.swap(true, Ordering::SeqCst) {
            return Err(PlugError::Config(
                "a plugin is already being served by this process".into(),
            ));
        }

        match std::env::var(COOKIE_KEY) {
            Ok(v) if v == COOKIE_VALUE => {}
            _ => {
                eprintln!(
                    "This binary is a plugtab plugin and is not meant to be run directly."
                );
                return Err(PlugError::Handshake(
                    "cookie environment variable missing or mismatched".into(),
                ));
            }
        }

        // Plugin logs go to stderr; the host leaves stderr attached to its
        // own, so `RUST_LOG=debug` on the plugin side just works.
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_writer(std::io::stderr)
            .try_init();

        spawn_parent_watchdog();

        let stdin = std::io::stdin();
        let stdout = std::io::stdout();
        self.serve_on(stdin.lock(), stdout.lock())
    }

    /// Run the request loop over an arbitrary byte stream. Split out from
    /// [`serve`](Self::serve) so tests can drive a session over a
    /// socketpair; production code always goes through `serve`.
    pub fn serve_on<R: Read, W: Write>(&self, mut reader: R, mut writer: W) -> Result<()> {
        // The first frame must be a valid handshake.
        let first: Request = match protocol::read_frame(&mut reader)? {
            Some(request) => request,
            None => return Ok(()), // host connected and left
        };

        match first {
            Request::Handshake {
                protocol_version,
                cookie_key,
                cookie_value,
            } => {
                if protocol_version != PROTOCOL_VERSION
                    || cookie_key != COOKIE_KEY
                    || cookie_value != COOKIE_VALUE
                {
                    let err = PlugError::Handshake(format!(
                        "host speaks protocol {protocol_version}, plugin speaks {PROTOCOL_VERSION}"
                    ));
                    protocol::write_frame(&mut writer, &Response::error(&err))?;
                    return Err(err);
                }
                protocol::write_frame(
                    &mut writer,
                    &Response::Welcome {
                        protocol_version: PROTOCOL_VERSION,
                        tables: self.endpoint.table_indices(),
                    },
                )?;
                info!("handshake complete");
            }
            other => {
                let err = PlugError::Handshake(format!(
                    "expected a handshake, got {other:?}"
                ));
                protocol::write_frame(&mut writer, &Response::error(&err))?;
                return Err(err);
            }
        }

        loop {
            let request: Request = match protocol::read_frame(&mut reader)? {
                Some(request) => request,
                None => {
                    debug!("host closed the channel");
                    break;
                }
            };

            if matches!(request, Request::Shutdown) {
                self.endpoint.close_all();
                protocol::write_frame(&mut writer, &Response::Ack)?;
                break;
            }

            let response = self.dispatch(request);
            protocol::write_frame(&mut writer, &response)?;
        }

        Ok(())
    }

    /// Map one request to one response. Dispatch failures become `Error`
    /// responses; only a broken channel aborts the loop.
    fn dispatch(&self, request: Request) -> Response {
        let result = match request {
            Request::Initialize { connection, table, config } => self
                .endpoint
                .initialize(connection, table, config)
                .map(|descriptor| Response::Schema { descriptor }),
            Request::Query {
                connection,
                table,
                cursor,
                constraint,
            } => self
                .endpoint
                .query(connection, table, cursor, &constraint)
                .map(|(rows, no_more_rows)| Response::Rows { rows, no_more_rows }),
            Request::Insert { connection, table, rows } => {
                self.endpoint.insert(connection, table, rows).map(|_| Response::Ack)
            }
            Request::Update { connection, table, rows } => {
                self.endpoint.update(connection, table, rows).map(|_| Response::Ack)
            }
            Request::Delete { connection, table, keys } => {
                self.endpoint.delete(connection, table, keys).map(|_| Response::Ack)
            }
            Request::CloseTable { connection, table } => {
                self.endpoint.close_table(connection, table).map(|_| Response::Ack)
            }
            Request::Handshake { .. } | Request::Shutdown => {
                Err(PlugError::Protocol("unexpected mid-session frame".into()))
            }
        };

        match result {
            Ok(response) => response,
            Err(err) => {
                error!(error = %err, "dispatch failed");
                Response::error(&err)
            }
        }
    }
}

impl Default for Plugin {
    fn default() -> Self {
        Self::new()
    }
}

/// Exit when the host dies: a plugin reparented to init has lost its
/// channel and would otherwise linger as a zombie worker.
fn spawn_parent_watchdog() {
    #[cfg(unix)]
    std::thread::spawn(|| {
        loop {
            std::thread::sleep(std::time::Duration::from_secs(2));
            if std::os::unix::process::parent_id() == 1 {
                std::process::exit(0);
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use plugtab_common::protocol::PluginConfig;
    use plugtab_common::{ColumnSpec, ColumnType, TableDescriptor, Value};

    fn single_row_plugin() -> Plugin {
        let mut plugin = Plugin::new();
        plugin
            .register(0, |_args| {
                struct T;
                struct R(bool);
                impl crate::Table for T {
                    fn create_reader(&mut self) -> Box<dyn crate::TableReader> {
                        Box::new(R(false))
                    }
                }
                impl crate::TableReader for R {
                    fn query(
                        &mut self,
                        _c: &plugtab_common::QueryConstraint,
                    ) -> Result<(Vec<Vec<Value>>, bool)> {
                        if self.0 {
                            return Ok((vec![], true));
                        }
                        self.0 = true;
                        Ok((vec![vec![Value::Int(1)]], true))
                    }
                }
                Ok((
                    Box::new(T) as Box<dyn crate::Table>,
                    TableDescriptor::new(vec![ColumnSpec::new("n", ColumnType::Int)]),
                ))
            })
            .unwrap();
        plugin
    }

    fn run_session(plugin: &Plugin, requests: &[Request]) -> Vec<Response> {
        let mut input = Vec::new();
        protocol::write_frame(
            &mut input,
            &Request::Handshake {
                protocol_version: PROTOCOL_VERSION,
                cookie_key: COOKIE_KEY.into(),
                cookie_value: COOKIE_VALUE.into(),
            },
        )
        .unwrap();
        for request in requests {
            protocol::write_frame(&mut input, request).unwrap();
        }

        let mut output = Vec::new();
        plugin.serve_on(input.as_slice(), &mut output).unwrap();

        let mut responses = Vec::new();
        let mut cursor = output.as_slice();
        while let Some(response) = protocol::read_frame::<_, Response>(&mut cursor).unwrap() {
            responses.push(response);
        }
        // Drop the Welcome, callers assert on the session body.
        assert!(matches!(responses.remove(0), Response::Welcome { .. }));
        responses
    }

    #[test]
    fn session_initializes_and_queries() {
        let plugin = single_row_plugin();
        let responses = run_session(
            &plugin,
            &[
                Request::Initialize { connection: 1, table: 0, config: PluginConfig::new() },
                Request::Query {
                    connection: 1,
                    table: 0,
                    cursor: 0,
                    constraint: Default::default(),
                },
                Request::Shutdown,
            ],
        );

        assert!(matches!(responses[0], Response::Schema { .. }));
        match &responses[1] {
            Response::Rows { rows, no_more_rows } => {
                assert_eq!(rows, &vec![vec![Value::Int(1)]]);
                assert!(no_more_rows);
            }
            other => panic!("expected rows, got {other:?}"),
        }
        assert!(matches!(responses[2], Response::Ack));
    }

    #[test]
    fn bad_cookie_handshake_is_rejected() {
        let plugin = single_row_plugin();

        let mut input = Vec::new();
        protocol::write_frame(
            &mut input,
            &Request::Handshake {
                protocol_version: PROTOCOL_VERSION,
                cookie_key: COOKIE_KEY.into(),
                cookie_value: "wrong".into(),
            },
        )
        .unwrap();

        let mut output = Vec::new();
        let result = plugin.serve_on(input.as_slice(), &mut output);
        assert!(matches!(result, Err(PlugError::Handshake(_))));

        let response: Response =
            protocol::read_frame(&mut output.as_slice()).unwrap().unwrap();
        assert!(matches!(response, Response::Error { .. }));
    }

    #[test]
    fn version_mismatch_is_rejected() {
        let plugin = single_row_plugin();

        let mut input = Vec::new();
        protocol::write_frame(
            &mut input,
            &Request::Handshake {
                protocol_version: PROTOCOL_VERSION + 1,
                cookie_key: COOKIE_KEY.into(),
                cookie_value: COOKIE_VALUE.into(),
            },
        )
        .unwrap();

        let mut output = Vec::new();
        assert!(matches!(
            plugin.serve_on(input.as_slice(), &mut output),
            Err(PlugError::Handshake(_))
        ));
    }

    #[test]
    fn errors_are_answered_not_fatal() {
        let plugin = single_row_plugin();
        let responses = run_session(
            &plugin,
            &[
                // Never initialized, and index 9 does not exist.
                Request::Query {
                    connection: 1,
                    table: 9,
                    cursor: 0,
                    constraint: Default::default(),
                },
                Request::Initialize { connection: 1, table: 0, config: PluginConfig::new() },
            ],
        );
        assert!(matches!(responses[0], Response::Error { .. }));
        assert!(matches!(responses[1], Response::Schema { .. }));
    }

    #[test]
    fn manifest_lists_registered_tables() {
        let plugin = single_row_plugin();
        let manifest = plugin.manifest();
        assert_eq!(manifest.protocol_version, PROTOCOL_VERSION);
        assert_eq!(manifest.tables, vec![0]);
    }
}
