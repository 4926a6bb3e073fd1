mod support;

use move_clippy_incremental::cache::{RuleSetCache, RuleSetSource};
use move_clippy_incremental::error::{PipelineError, PipelineResult};
use move_clippy_incremental::location::{FetchContext, RuleSetConfiguration, RuleSetLocation};
use parking_lot::Mutex;
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use support::http::RuleServer;

fn rules(id: &str) -> String {
    format!("name = \"remote\"\n\n[[rule]]\nid = \"{id}\"\nmessage = \"m\"\npattern = \"x\"\n")
}

fn ctx() -> FetchContext {
    FetchContext {
        http_timeout: Duration::from_secs(5),
        ..FetchContext::default()
    }
}

fn remote(server: &RuleServer, path: &str) -> RuleSetConfiguration {
    RuleSetConfiguration::new(1, "remote", RuleSetLocation::NetworkUri(server.url(path)))
}

/// Fetches through the location and remembers where each copy was stored.
#[derive(Default)]
struct RecordingSource {
    copies: Mutex<Vec<PathBuf>>,
}

impl RuleSetSource for RecordingSource {
    fn open_stream(
        &self,
        location: &RuleSetLocation,
        ctx: &FetchContext,
    ) -> PipelineResult<Box<dyn Read + Send>> {
        let fetched = location.fetch(ctx)?;
        self.copies.lock().push(fetched.path().to_path_buf());
        let mut bytes = Vec::new();
        fetched.open()?.read_to_end(&mut bytes)?;
        Ok(Box::new(std::io::Cursor::new(bytes)))
    }
}

#[test]
fn every_download_gets_its_own_temporary_file() {
    let server = RuleServer::start().unwrap();
    server.set("team.toml", &rules("a"));
    let config = remote(&server, "team.toml");

    let first = config.location.fetch(&ctx()).unwrap();
    let second = config.location.fetch(&ctx()).unwrap();
    let (a, b) = (first.path().to_path_buf(), second.path().to_path_buf());
    assert_ne!(a, b);
    assert!(a.is_file() && b.is_file());

    let mut body = String::new();
    first.open().unwrap().read_to_string(&mut body).unwrap();
    assert_eq!(body, rules("a"));

    drop(first);
    drop(second);
    assert!(!a.exists());
    assert!(!b.exists());
}

#[test]
fn invalidated_remote_rule_set_is_downloaded_again() {
    let server = RuleServer::start().unwrap();
    server.set("team.toml", &rules("a"));
    let source = Arc::new(RecordingSource::default());
    let cache = RuleSetCache::new(source.clone(), ctx());
    let config = remote(&server, "team.toml");

    assert_eq!(cache.resolve(&config).unwrap().rules[0].id(), "a");
    assert_eq!(cache.resolve(&config).unwrap().rules[0].id(), "a");
    assert_eq!(server.requests(), 1);

    server.set("team.toml", &rules("b"));
    assert!(cache.invalidate(&config.location));
    assert_eq!(cache.resolve(&config).unwrap().rules[0].id(), "b");
    assert_eq!(server.requests(), 2);

    let copies = source.copies.lock().clone();
    assert_eq!(copies.len(), 2);
    assert_ne!(copies[0], copies[1]);
    assert!(copies.iter().all(|copy| !copy.exists()));
}

#[test]
fn http_errors_are_unreachable_and_not_cached() {
    let server = RuleServer::start().unwrap();
    server.set_status("team.toml", 500, "boom");
    let cache = RuleSetCache::with_default_source(ctx());
    let config = remote(&server, "team.toml");

    let err = cache.resolve(&config).unwrap_err();
    assert!(matches!(err, PipelineError::ConfigurationUnreachable { .. }));
    let missing = cache.resolve(&remote(&server, "missing.toml")).unwrap_err();
    assert!(matches!(missing, PipelineError::ConfigurationUnreachable { .. }));

    server.set("team.toml", &rules("recovered"));
    assert_eq!(cache.resolve(&config).unwrap().rules[0].id(), "recovered");
}
