//! Integration tests for the `ragbase` binary.
//!
//! No embedding backend is reachable from tests, so the binary runs with the
//! `disabled` provider: documents are extracted and chunked, then fail at
//! indexing, and questions degrade to the apology answer.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn ragbase_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("ragbase");
    path
}

fn minimal_docx_with_text(phrase: &str) -> Vec<u8> {
    use std::io::Write;
    let mut buf = Vec::new();
    {
        let mut zip = zip::ZipWriter::new(std::io::Cursor::new(&mut buf));
        zip.start_file("word/document.xml", zip::write::SimpleFileOptions::default())
            .unwrap();
        let xml = format!(
            "<?xml version=\"1.0\"?><w:document xmlns:w=\"http://schemas.openxmlformats.org/wordprocessingml/2006/main\"><w:body><w:p><w:r><w:t>{}</w:t></w:r></w:p></w:body></w:document>",
            phrase
        );
        zip.write_all(xml.as_bytes()).unwrap();
        zip.finish().unwrap();
    }
    buf
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let files_dir = root.join("files");
    fs::create_dir_all(&files_dir).unwrap();
    fs::write(
        files_dir.join("alpha notes.md"),
        "# Alpha\n\nNotes about Rust programming, cargo, and crates.",
    )
    .unwrap();
    fs::write(files_dir.join("bad.pdf"), b"not a valid pdf").unwrap();
    fs::write(files_dir.join("report.docx"), minimal_docx_with_text("quarterly figures")).unwrap();

    let config_content = format!(
        r#"[storage]
data_dir = "{root}/data"
upload_dir = "{root}/uploads"

[chunking]
chunk_size = 200
chunk_overlap = 20

[embedding]
provider = "disabled"

[index]
init_retries = 2
init_retry_delay_ms = 1

[ingest]
workers = 2
max_upload_mb = 1
"#,
        root = root.display()
    );

    let config_path = root.join("ragbase.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_ragbase(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = ragbase_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run ragbase binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

fn file(tmp: &TempDir, name: &str) -> String {
    tmp.path().join("files").join(name).display().to_string()
}

#[test]
fn test_documents_empty() {
    let (_tmp, config_path) = setup_test_env();
    let (stdout, stderr, success) = run_ragbase(&config_path, &["documents"]);
    assert!(success, "documents failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("No documents."));
}

#[test]
fn test_ingest_records_terminal_states() {
    let (tmp, config_path) = setup_test_env();
    let alpha = file(&tmp, "alpha notes.md");
    let bad = file(&tmp, "bad.pdf");
    let report = file(&tmp, "report.docx");

    let (stdout, stderr, success) = run_ragbase(&config_path, &["ingest", &alpha, &bad, &report]);
    assert!(success, "ingest failed: stdout={}, stderr={}", stdout, stderr);

    assert!(stdout.contains("accepted alpha_notes.md"), "{}", stdout);
    assert!(stdout.contains("accepted bad.pdf"), "{}", stdout);
    // Extraction failure is recorded before indexing is attempted.
    assert!(stdout.contains("PDF extraction"), "{}", stdout);
    // Text documents get through extraction and chunking, then hit the
    // unavailable index.
    assert!(stdout.contains("vector index unavailable"), "{}", stdout);
    assert!(!stdout.contains("completed"), "{}", stdout);
    assert!(tmp.path().join("uploads").join("alpha_notes.md").exists());

    let (status_out, _, success) = run_ragbase(&config_path, &["status", "bad.pdf"]);
    assert!(success);
    assert!(status_out.contains("bad.pdf  failed  0%"), "{}", status_out);

    let (docs_out, _, success) = run_ragbase(&config_path, &["documents"]);
    assert!(success);
    assert_eq!(docs_out.lines().filter(|l| l.contains("  failed  ")).count(), 3);
    assert!(docs_out.contains("last updated:"));
}

#[test]
fn test_oversized_upload_rejected() {
    let (tmp, config_path) = setup_test_env();
    let big = tmp.path().join("files").join("big.txt");
    fs::write(&big, vec![b'x'; 2 * 1024 * 1024]).unwrap();

    let (_, stderr, success) =
        run_ragbase(&config_path, &["ingest", big.to_str().unwrap()]);
    assert!(!success);
    assert!(stderr.contains("upload rejected"), "{}", stderr);
}

#[test]
fn test_status_unknown_document() {
    let (_tmp, config_path) = setup_test_env();
    let (_, stderr, success) = run_ragbase(&config_path, &["status", "ghost.pdf"]);
    assert!(!success);
    assert!(stderr.contains("Unknown document"));
}

#[test]
fn test_ask_degrades_without_backends() {
    let (_tmp, config_path) = setup_test_env();
    let (stdout, stderr, success) = run_ragbase(&config_path, &["ask", "what is cargo?"]);
    assert!(success, "ask failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("Sorry"), "{}", stdout);
}

#[test]
fn test_ask_input_errors() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, success) = run_ragbase(&config_path, &["ask", "  "]);
    assert!(!success, "empty question must fail");

    let (_, stderr, success) =
        run_ragbase(&config_path, &["ask", "cargo?", "--document", "ghost.pdf"]);
    assert!(!success);
    assert!(stderr.contains("unknown document"), "{}", stderr);
}

#[test]
fn test_size_fails_when_index_unusable() {
    let (_tmp, config_path) = setup_test_env();
    let (_, stderr, success) = run_ragbase(&config_path, &["size"]);
    assert!(!success);
    assert!(stderr.contains("vector index unavailable"), "{}", stderr);
}
