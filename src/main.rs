use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use log::{debug, info};
use sha2::{Digest, Sha256, Sha384};
use structopt::StructOpt;

use cfgdata::cfg::{self, CreateOptions, MergeEngine, ParsedBlob, Payload, Resolver};

mod cli;

use cli::{Command, ExtractOpts, HashAlgorithm, MergeOpts, ViewOpts};

fn read_file(path: &Path) -> Result<Vec<u8>, anyhow::Error> {
    fs::read(path).with_context(|| format!("Failed to read '{}'", path.display()))
}

/// Writes `data` to a temporary file next to `path` and moves it into place
fn write_file(path: &Path, data: &[u8]) -> Result<(), anyhow::Error> {
    let mut tmp_name = OsString::from(path.as_os_str());
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);

    fs::write(&tmp_path, data)
        .with_context(|| format!("Failed to write '{}'", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| {
        format!(
            "Failed to move '{}' to '{}'",
            tmp_path.display(),
            path.display()
        )
    })?;

    Ok(())
}

fn parse_file(path: &Path) -> Result<(Vec<u8>, ParsedBlob), anyhow::Error> {
    let buf = read_file(path)?;
    let blob = cfg::parse(&buf, None)
        .with_context(|| format!("Failed to parse blob '{}'", path.display()))?;

    Ok((buf, blob))
}

fn to_hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|byte| format!("{:02x}", byte))
        .collect::<Vec<_>>()
        .join(" ")
}

fn digest(algorithm: HashAlgorithm, bytes: &[u8]) -> String {
    match algorithm {
        HashAlgorithm::Sha256 => format!("{:x}", Sha256::digest(bytes)),
        HashAlgorithm::Sha384 => format!("{:x}", Sha384::digest(bytes)),
    }
}

/// Prints one line per record, with payload details depending on `verbose`
fn print_records(blob: &ParsedBlob, verbose: u8) {
    for parsed in &blob.records {
        let record = &parsed.record;

        println!(
            "  Tag {:#05x} v{} {:?}, {} bytes, platforms {:#010x}",
            record.tag,
            record.version,
            record.payload.record_type(),
            record.payload.encoded_len(),
            parsed.mask
        );

        if verbose == 0 {
            continue;
        }

        match &record.payload {
            Payload::Normal(data) => println!("    Data: {}", to_hex(data)),
            Payload::PlatformId { id, .. } => println!("    Platform id: {}", id),
            Payload::Reference(reference) => println!(
                "    Refers to tag {:#05x} of platform {} in the {} blob",
                reference.tag,
                reference.platform_id,
                if reference.is_internal {
                    "internal"
                } else {
                    "external"
                }
            ),
            Payload::Array(array) => {
                println!(
                    "    Base {:?}, {} items of {} bytes, id bits {}+{}, marker bit {}",
                    array.base,
                    array.items.len(),
                    array.item_size,
                    array.id_bit_offset,
                    array.id_bit_length,
                    array.valid_bit_offset
                );
                println!("    Bitmask: {}", to_hex(&array.bitmask));

                if verbose < 2 {
                    continue;
                }

                for (index, item) in array.items.iter().enumerate() {
                    println!(
                        "      [{}] id {:#x}{}: {}",
                        index,
                        array.item_id(item),
                        if array.has_marker(item) { " *" } else { "" },
                        to_hex(item)
                    );
                }
            }
        }
    }
}

fn view(opts: &ViewOpts) -> Result<(), anyhow::Error> {
    for path in &opts.files {
        let (buf, blob) = parse_file(path)?;
        let header = &blob.header;

        println!("{}:", path.display());
        println!(
            "  Attribute {:#04x}{}{}, svn {}, used {:#x}, total {:#x}",
            header.attribute,
            if header.is_merged() { " merged" } else { "" },
            if header.is_signed() { " signed" } else { "" },
            header.svn,
            header.used_length,
            header.total_length
        );
        println!("  Platform: {:?}", blob.platform);
        println!(
            "  {}: {}",
            opts.hash,
            digest(opts.hash, &buf[..header.used_length as usize])
        );

        print_records(&blob, opts.verbose);
    }

    Ok(())
}

/// Loads every input, merges them and saves the result to `output`
///
/// Built-in files are loaded first. Nothing is written unless every input loads and the merge
/// succeeds. Returns the number of merged files and the encoded blob.
fn merge_files(
    builtin: &[PathBuf],
    files: &[PathBuf],
    options: CreateOptions,
    output: &Path,
) -> Result<(usize, Vec<u8>), anyhow::Error> {
    if files.is_empty() && builtin.is_empty() {
        bail!("No input files given");
    }

    let mut engine = MergeEngine::new();
    let inputs = builtin
        .iter()
        .map(|path| (path, true))
        .chain(files.iter().map(|path| (path, false)));

    for (path, builtin) in inputs {
        let buf = read_file(path)?;

        engine
            .add_file(path.display().to_string(), &buf, builtin)
            .with_context(|| format!("Failed to load '{}'", path.display()))?;
    }

    let blob = engine
        .create(options)
        .with_context(|| "Failed to merge blobs")?;
    let bytes = blob
        .to_bytes()
        .with_context(|| "Failed to encode merged blob")?;

    write_file(output, &bytes)?;

    Ok((engine.files().len(), bytes))
}

fn merge(opts: &MergeOpts) -> Result<(), anyhow::Error> {
    let options = CreateOptions {
        platform_id: opts.platform_id,
        svn: opts.svn,
    };
    let (file_count, bytes) = merge_files(&opts.builtin, &opts.files, options, &opts.output)?;
    let parsed = cfg::parse(&bytes, None).with_context(|| "Failed to parse merged blob")?;

    println!(
        "Merged {} files into {} records ({} bytes), saved to {}",
        file_count,
        parsed.records.len(),
        bytes.len(),
        opts.output.display()
    );

    if opts.verbose > 0 {
        print_records(&parsed, opts.verbose);
    }

    Ok(())
}

fn extract(opts: &ExtractOpts) -> Result<(), anyhow::Error> {
    let (internal, external) = match opts.files.as_slice() {
        [external] => (None, parse_file(external)?.1),
        [internal, external] => (Some(parse_file(internal)?.1), parse_file(external)?.1),
        _ => bail!("Expected one or two blobs, got {}", opts.files.len()),
    };

    let resolver = Resolver::new(internal.as_ref(), Some(&external));
    let payload = resolver
        .resolve(opts.platform_id, opts.tag)
        .with_context(|| {
            format!(
                "Failed to resolve tag {:#05x} for platform {}",
                opts.tag, opts.platform_id
            )
        })?;
    let bytes = payload.to_bytes()?;

    debug!("Resolved payload: {:?}", payload);

    match &opts.output {
        Some(output) => {
            write_file(output, &bytes)?;

            info!("Saved {} bytes to {}", bytes.len(), output.display());
        }
        None => println!("{}", to_hex(&bytes)),
    }

    Ok(())
}

fn main() -> Result<(), anyhow::Error> {
    // Create a logger with a timestamp that logs everything at Info level or above
    pretty_env_logger::init_timed();

    // Parse the command-line arguments
    let opts = cli::Opts::from_args();

    match &opts.command {
        Command::View(view_opts) => view(view_opts)?,
        Command::Merge(merge_opts) => merge(merge_opts)?,
        Command::Extract(extract_opts) => extract(extract_opts)?,
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use hex_literal::hex;

    use super::*;

    const PLATFORM_3_BLOB: [u8; 36] = hex!(
        "43 46 47 44 10 00 00 00 24 00 00 00 24 00 00 00"
        "08 00 00 0F 03 00 00 00"
        "0C 00 00 10 BB AA 00 00 44 33 22 11"
    );

    /// Returns a fresh scratch directory for `name`
    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("cfgdata-{}-{}", name, std::process::id()));

        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();

        dir
    }

    #[test]
    fn it_should_write_merged_blob() {
        let dir = scratch_dir("merge-ok");
        let input = dir.join("board.bin");
        let output = dir.join("merged.bin");

        fs::write(&input, &PLATFORM_3_BLOB[..]).unwrap();

        let (file_count, bytes) =
            merge_files(&[], &[input], CreateOptions::default(), &output).unwrap();

        assert_eq!(file_count, 1);
        assert_eq!(fs::read(&output).unwrap(), bytes);
        assert!(cfg::parse(&bytes, None).unwrap().header.is_merged());

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn it_should_not_write_output_when_an_input_is_misaligned() {
        let dir = scratch_dir("merge-misaligned");
        let good = dir.join("good.bin");
        let bad = dir.join("bad.bin");
        let output = dir.join("merged.bin");

        let mut misaligned = PLATFORM_3_BLOB;
        misaligned[8] = 0x22;

        fs::write(&good, &PLATFORM_3_BLOB[..]).unwrap();
        fs::write(&bad, &misaligned[..]).unwrap();

        let result = merge_files(&[], &[good, bad], CreateOptions::default(), &output);

        assert!(result.is_err());
        assert!(!output.exists());

        let mut tmp_name = OsString::from(output.as_os_str());
        tmp_name.push(".tmp");
        assert!(!PathBuf::from(tmp_name).exists());

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn it_should_reject_empty_input_list() {
        let dir = scratch_dir("merge-empty");
        let output = dir.join("merged.bin");

        assert!(merge_files(&[], &[], CreateOptions::default(), &output).is_err());
        assert!(!output.exists());

        fs::remove_dir_all(&dir).unwrap();
    }
}
