use gcpack::*;
use std::error::Error;

fn main() -> Result<(), Box<dyn Error>> {
    let dir = tempfile::tempdir()?;
    let registry = FormatRegistry::with_defaults();
    let texts = registry.get("texts")?;

    // Ten revisions of one file, each adding a line to the last
    let store = texts.create(dir.path().join("texts"))?;
    let mut writer = store.start_write_group()?;
    let mut lines: Vec<String> = Vec::new();
    let mut parent: Option<Key> = None;
    for rev in 0..10 {
        lines.push(format!("line {} of the file\n", rev));
        let key = Key::new(["README", format!("rev-{}", rev).as_str()])?;
        let parents = parent.iter().cloned().collect();
        let (sha1, len) = writer.add_lines(key.clone(), Some(parents), &lines[..], None)?;
        println!("{} -> {} ({} bytes)", key, sha1, len);
        parent = Some(key);
    }
    let pack = writer.end()?;
    println!("committed pack {:?}", pack);

    // Read the newest revision back
    let newest = Key::new(["README", "rev-9"])?;
    for record in store.get_record_stream(&[newest], RecordOrder::AsRequested, true) {
        let record = record?;
        println!("{} is stored as {:?}", record.key(), record.storage_kind());
        if let Some(bytes) = record.bytes() {
            print!("{}", String::from_utf8_lossy(&bytes));
        }
    }

    // Copy everything into a second store
    let copy = texts.create(dir.path().join("copy"))?;
    let keys = store.keys();
    let (summary, _) =
        copy.insert_record_stream(store.get_record_stream(&keys, RecordOrder::GroupCompress, false))?;
    println!(
        "copied {} records, {} through their original block",
        summary.inserted, summary.reused
    );
    Ok(())
}
