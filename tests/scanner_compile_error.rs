//! End-to-end coverage for a malformed component source
//! (`spec.md` §8 scenario 3).

use templar::config::ScannerConfig;
use templar::error::Error;
use templar::{Registry, Scanner};

#[tokio::test]
async fn unterminated_parameter_list_is_reported_and_nothing_is_registered() {
    let dir = tempfile::tempdir().unwrap();
    let file_path = dir.path().join("button.tmpl");
    // Missing the closing paren after `label string`.
    tokio::fs::write(&file_path, "package widgets\n\ncomponent Button(label string\n")
        .await
        .unwrap();

    let registry = Registry::new(32, 64);
    let scanner = Scanner::new(registry.clone(), dir.path(), ScannerConfig::default());
    let report = scanner.scan_file(&file_path).await.unwrap();

    assert!(report.registered.is_empty(), "no component should be registered from malformed source");
    assert_eq!(report.errors.len(), 1);
    assert!(matches!(&report.errors[0], Error::ParseError { message, .. } if message.contains("unterminated parameter list")));
    assert_eq!(registry.count(), 0);
}
