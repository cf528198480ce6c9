use std::io::Write;

use v2v_core::state::StateStore;
use v2v_logparser::OutputParser;

#[test]
fn parse_resumes_from_previous_offset_across_calls() {
    let dir = tempfile::tempdir().unwrap();
    let v2v_log = dir.path().join("v2v.log");
    let mr_log = dir.path().join("v2v.json");
    std::fs::write(&v2v_log, b"Copying disk 1/2 to /tmp/out1\n").unwrap();
    std::fs::write(&mr_log, b"").unwrap();

    let mut parser = OutputParser::open(&v2v_log, &mr_log).unwrap();
    let mut state = StateStore::new(dir.path().join("state.json"));

    parser.parse(&mut state).unwrap();
    assert_eq!(state.snapshot().disk_count, Some(2));

    // Append more content after the first parse call; a second call should
    // pick up only the newly appended bytes, not reprocess the first line.
    {
        let mut f = std::fs::OpenOptions::new().append(true).open(&v2v_log).unwrap();
        writeln!(f, "  (50.00/100%)").unwrap();
    }
    parser.parse(&mut state).unwrap();
    // No disk entry exists yet (none were seeded), so the progress line is a no-op;
    // the point of this test is that parse() didn't error or reprocess disk_count.
    assert_eq!(state.snapshot().disk_count, Some(2));
}

#[test]
fn open_waits_for_log_files_to_appear() {
    let dir = tempfile::tempdir().unwrap();
    let v2v_log = dir.path().join("v2v.log");
    let mr_log = dir.path().join("v2v.json");

    let handle = {
        let v2v_log = v2v_log.clone();
        let mr_log = mr_log.clone();
        std::thread::spawn(move || OutputParser::open(v2v_log, mr_log))
    };

    std::thread::sleep(std::time::Duration::from_millis(200));
    std::fs::write(&v2v_log, b"").unwrap();
    std::fs::write(&mr_log, b"").unwrap();

    let parser = handle.join().unwrap();
    assert!(parser.is_ok());
}
