//! Shared helpers for the end-to-end tests.

use tempfile::TempDir;
use tessera::{Server, ServerConfig, ServerHandle, Session};

/// A server bound to a socket in its own temp directory.
pub struct TestServer {
    pub handle: ServerHandle,
    _dir: TempDir,
}

impl TestServer {
    pub fn start() -> TestServer {
        let dir = TempDir::new().expect("create temp dir");
        let config = ServerConfig::small(dir.path().join("tessera.sock"));
        let handle = Server::start(config).expect("start server");
        TestServer { handle, _dir: dir }
    }

    pub fn connect(&self) -> Session {
        Session::connect(self.handle.socket_path()).expect("connect session")
    }
}
