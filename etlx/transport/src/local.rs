//! Local file copy and compression.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::Path;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::debug;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::Result;

fn create_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
}

/// Copy `source` to `target`, creating the target directory. Returns bytes copied.
pub fn copy_file(source: &Path, target: &Path) -> Result<u64> {
    create_parent(target)?;
    let copied = std::fs::copy(source, target)?;
    debug!("Copied {} to {}", source.display(), target.display());
    Ok(copied)
}

/// Deflate every file into a single zip archive, each stored under its file name.
pub fn zip_files<P: AsRef<Path>>(files: &[P], output: &Path) -> Result<()> {
    create_parent(output)?;
    let mut writer = ZipWriter::new(BufWriter::new(File::create(output)?));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    for file in files {
        let file = file.as_ref();
        let name = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| file.display().to_string());
        writer.start_file(name, options)?;
        io::copy(&mut BufReader::new(File::open(file)?), &mut writer)?;
    }

    writer.finish()?.flush()?;
    Ok(())
}

/// Gzip a single file.
pub fn gzip_file(input: &Path, output: &Path) -> Result<()> {
    create_parent(output)?;
    let mut encoder = GzEncoder::new(BufWriter::new(File::create(output)?), Compression::default());
    io::copy(&mut BufReader::new(File::open(input)?), &mut encoder)?;
    encoder.finish()?.flush()?;
    Ok(())
}

/// Extract a zip archive into `output_dir`.
pub fn unzip(input: &Path, output_dir: &Path) -> Result<()> {
    std::fs::create_dir_all(output_dir)?;
    let mut archive = ZipArchive::new(BufReader::new(File::open(input)?))?;
    archive.extract(output_dir)?;
    Ok(())
}

/// Decompress a gzip file.
pub fn gunzip(input: &Path, output: &Path) -> Result<()> {
    create_parent(output)?;
    let mut decoder = GzDecoder::new(BufReader::new(File::open(input)?));
    let mut writer = BufWriter::new(File::create(output)?);
    io::copy(&mut decoder, &mut writer)?;
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_creates_target_dir() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("a.txt");
        std::fs::write(&source, "hello").unwrap();

        let target = dir.path().join("nested/out/b.txt");
        assert_eq!(copy_file(&source, &target).unwrap(), 5);
        assert_eq!(std::fs::read_to_string(target).unwrap(), "hello");
    }

    #[test]
    fn zip_then_unzip() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.csv");
        let b = dir.path().join("b.csv");
        std::fs::write(&a, "id\n1\n").unwrap();
        std::fs::write(&b, "id\n2\n").unwrap();

        let archive = dir.path().join("out.zip");
        zip_files(&[&a, &b], &archive).unwrap();

        let extracted = dir.path().join("extracted");
        unzip(&archive, &extracted).unwrap();
        assert_eq!(std::fs::read_to_string(extracted.join("b.csv")).unwrap(), "id\n2\n");
    }

    #[test]
    fn gzip_then_gunzip() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("data.csv");
        std::fs::write(&input, "x,y\n1,2\n").unwrap();

        let gz = dir.path().join("data.csv.gz");
        gzip_file(&input, &gz).unwrap();
        let restored = dir.path().join("restored.csv");
        gunzip(&gz, &restored).unwrap();

        assert_eq!(std::fs::read_to_string(restored).unwrap(), "x,y\n1,2\n");
    }
}
