use clap::Parser;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use initrd::{ALIGNMENT, MAX_HEADER_SIZE};

#[derive(Parser)]
#[command(name = "initrd")]
#[command(about = "Packs a directory tree into an Ember boot archive")]
struct Args {
    /// Directory to pack; its contents appear at the archive root
    #[arg(short, long)]
    input: PathBuf,

    /// Output archive file
    #[arg(short, long, default_value = "initrd.img")]
    output: PathBuf,
}

/// Collects the regular files under `dir`, depth first in name order.
///
/// Entries whose name starts with a dot are skipped, as are symlinks and other special files.
fn collect_files(dir: &Path, files: &mut Vec<PathBuf>) -> std::io::Result<()> {
    let mut entries = fs::read_dir(dir)?.collect::<Result<Vec<_>, _>>()?;
    entries.sort_by_key(|entry| entry.file_name());

    for entry in entries {
        if entry.file_name().to_string_lossy().starts_with('.') {
            continue;
        }

        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            collect_files(&entry.path(), files)?;
        } else if file_type.is_file() {
            files.push(entry.path());
        }
    }

    Ok(())
}

/// Returns the archive name for `path`: its components relative to `root`, joined by
/// `/` with a leading `/`.
fn archive_name(root: &Path, path: &Path) -> Result<String, Box<dyn std::error::Error>> {
    let relative = path.strip_prefix(root)?;
    let mut name = String::new();
    for component in relative.components() {
        let component = component
            .as_os_str()
            .to_str()
            .ok_or_else(|| format!("{} is not valid UTF-8", path.display()))?;
        name.push('/');
        name.push_str(component);
    }
    Ok(name)
}

fn write_record<W: Write>(
    out: &mut W,
    name: &str,
    contents: &[u8],
) -> Result<(), Box<dyn std::error::Error>> {
    let mut header = [0u8; MAX_HEADER_SIZE];
    let header_len = initrd::encode_header(&mut header, name, contents.len() as u64)?;

    out.write_all(&header[..header_len])?;
    out.write_all(contents)?;
    out.write_all(&[0; ALIGNMENT][..initrd::padding(contents.len())])?;
    Ok(())
}

/// Packs every file under `root` into `out` and returns the number of files written.
fn pack<W: Write>(root: &Path, out: &mut W) -> Result<usize, Box<dyn std::error::Error>> {
    if !root.is_dir() {
        return Err(format!("{} is not a directory", root.display()).into());
    }

    let mut files = Vec::new();
    collect_files(root, &mut files)?;

    for path in &files {
        let name = archive_name(root, path)?;
        let contents = fs::read(path)?;
        println!("[f] {} ({} bytes)", name, contents.len());
        write_record(out, &name, &contents)?;
    }

    Ok(files.len())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut out = BufWriter::new(fs::File::create(&args.output)?);
    let count = pack(&args.input, &mut out)?;
    out.flush()?;

    println!("packed {} files into {}", count, args.output.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use initrd::Archive;
    use tempfile::TempDir;

    #[test]
    fn packs_directory_tree() {
        let scratch = TempDir::new().unwrap();
        let root = scratch.path();
        fs::create_dir_all(root.join("sbin")).unwrap();
        fs::create_dir_all(root.join(".git")).unwrap();
        fs::write(root.join("sbin/init"), b"\x7fELF").unwrap();
        fs::write(root.join("motd"), b"welcome\n").unwrap();
        fs::write(root.join(".hidden"), b"skip me").unwrap();
        fs::write(root.join(".git/config"), b"skip me too").unwrap();

        let mut out = Vec::new();
        assert_eq!(pack(root, &mut out).unwrap(), 2);

        let archive = Archive::new(&out);
        let names: Vec<_> = archive.iter().map(|entry| entry.name).collect();
        assert_eq!(names, ["/motd", "/sbin/init"]);
        assert_eq!(archive.lookup("/sbin/init"), Some(&b"\x7fELF"[..]));
    }

    #[test]
    fn rejects_files_as_input() {
        let scratch = TempDir::new().unwrap();
        let file = scratch.path().join("plain");
        fs::write(&file, b"").unwrap();

        let mut out = Vec::new();
        assert!(pack(&file, &mut out).is_err());
        assert!(out.is_empty());
    }

    #[test]
    fn names_are_rooted() {
        let root = Path::new("/tmp/ramdisk");
        let name = archive_name(root, &root.join("sbin").join("init")).unwrap();
        assert_eq!(name, "/sbin/init");
    }

    #[test]
    fn records_round_trip_through_archive() {
        let mut out = Vec::new();
        write_record(&mut out, "/a", b"abc").unwrap();
        write_record(&mut out, "/b", b"").unwrap();

        // 23-byte header, 3 bytes of contents and 5 of padding, then a bare header.
        assert_eq!(out.len(), 31 + 23);
        let archive = Archive::new(&out);
        assert_eq!(archive.lookup("/a"), Some(&b"abc"[..]));
        assert_eq!(archive.lookup("/b"), Some(&b""[..]));
    }
}
