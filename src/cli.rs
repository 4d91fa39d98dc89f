use std::convert::TryFrom;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use structopt::StructOpt;

/// Parses a decimal or `0x` prefixed hexadecimal number
fn parse_number<T: TryFrom<u64>>(src: &str) -> Result<T, String> {
    let value = match src.strip_prefix("0x").or_else(|| src.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => src.parse::<u64>(),
    }
    .map_err(|err| format!("Invalid number '{}': {}", src, err))?;

    T::try_from(value).map_err(|_| format!("Number {} is out of range", src))
}

fn parse_u8(src: &str) -> Result<u8, String> {
    parse_number(src)
}

fn parse_u16(src: &str) -> Result<u16, String> {
    parse_number(src)
}

/// The digest printed for each viewed blob
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum HashAlgorithm {
    Sha256,
    Sha384,
}

impl FromStr for HashAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sha256" => Ok(HashAlgorithm::Sha256),
            "sha384" => Ok(HashAlgorithm::Sha384),
            _ => Err(format!("Unsupported hash algorithm '{}'", s)),
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HashAlgorithm::Sha256 => write!(f, "SHA-256"),
            HashAlgorithm::Sha384 => write!(f, "SHA-384"),
        }
    }
}

#[derive(StructOpt, Debug)]
pub struct ViewOpts {
    /// The blobs to print
    #[structopt(required = true)]
    pub files: Vec<PathBuf>,
    /// Detail level: 1 adds payload data, 2 adds array items
    #[structopt(
        env = "CFGDATA_VERBOSE",
        short = "v",
        long = "verbose",
        default_value = "0"
    )]
    pub verbose: u8,
    /// Digest algorithm to show for each blob
    #[structopt(
        short = "a",
        long = "hash",
        default_value = "sha256",
        possible_values = &["sha256", "sha384"],
        case_insensitive = true
    )]
    pub hash: HashAlgorithm,
}

#[derive(StructOpt, Debug)]
pub struct MergeOpts {
    /// Per-platform or merged blobs to merge
    pub files: Vec<PathBuf>,
    /// The name of the file to save the merged blob to
    #[structopt(short = "o", long = "output", required = true)]
    pub output: PathBuf,
    /// Platform id to write into the platform id record of the output
    #[structopt(
        env = "CFGDATA_PLATFORM_ID",
        short = "p",
        long = "platform-id",
        parse(try_from_str = parse_u8)
    )]
    pub platform_id: Option<u8>,
    /// Pre-signed built-in blobs, merged ahead of the other files
    #[structopt(short = "b", long = "builtin")]
    pub builtin: Vec<PathBuf>,
    /// Security version number of the output
    #[structopt(long = "svn", parse(try_from_str = parse_u8))]
    pub svn: Option<u8>,
    /// Print the merged records at the given detail level
    #[structopt(
        env = "CFGDATA_VERBOSE",
        short = "v",
        long = "verbose",
        default_value = "0"
    )]
    pub verbose: u8,
}

#[derive(StructOpt, Debug)]
pub struct ExtractOpts {
    /// The external blob, or the internal blob followed by the external blob
    #[structopt(required = true, max_values = 2)]
    pub files: Vec<PathBuf>,
    /// The tag to look up
    #[structopt(short = "t", long = "tag", parse(try_from_str = parse_u16))]
    pub tag: u16,
    /// The platform to resolve the tag for
    #[structopt(
        short = "p",
        long = "platform-id",
        default_value = "0",
        parse(try_from_str = parse_u8)
    )]
    pub platform_id: u8,
    /// The name of the file to save the payload to instead of printing it
    #[structopt(short = "o", long = "output")]
    pub output: Option<PathBuf>,
}

#[derive(StructOpt, Debug)]
pub enum Command {
    /// Print the header and records of blobs
    View(ViewOpts),
    /// Merge per-platform blobs into a single multi-platform blob
    Merge(MergeOpts),
    /// Print or save the value of a tag for a platform
    Extract(ExtractOpts),
}

#[derive(StructOpt, Debug)]
#[structopt(name = "cfgdata-tool")]
pub struct Opts {
    #[structopt(subcommand)]
    pub command: Command,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_should_parse_decimal_and_hex_numbers() {
        assert_eq!(parse_u16("240"), Ok(240));
        assert_eq!(parse_u16("0xF0"), Ok(0xF0));
        assert_eq!(parse_u8("0X1f"), Ok(31));
        assert!(parse_u8("0x100").is_err());
        assert!(parse_u8("twelve").is_err());
    }

    #[test]
    fn it_should_parse_merge_command() {
        let opts = Opts::from_iter(&[
            "cfgdata-tool",
            "merge",
            "a.bin",
            "b.bin",
            "-o",
            "out.bin",
            "-b",
            "builtin.bin",
            "--svn",
            "0x3",
        ]);

        match opts.command {
            Command::Merge(merge) => {
                assert_eq!(merge.files.len(), 2);
                assert_eq!(merge.builtin, vec![PathBuf::from("builtin.bin")]);
                assert_eq!(merge.svn, Some(3));
                assert_eq!(merge.output, PathBuf::from("out.bin"));
            }
            other => panic!("expected merge, got {:?}", other),
        }
    }

    #[test]
    fn it_should_parse_extract_command() {
        let opts = Opts::from_iter(&[
            "cfgdata-tool",
            "extract",
            "internal.bin",
            "external.bin",
            "-t",
            "0x100",
            "-p",
            "5",
        ]);

        match opts.command {
            Command::Extract(extract) => {
                assert_eq!(extract.files.len(), 2);
                assert_eq!(extract.tag, 0x100);
                assert_eq!(extract.platform_id, 5);
                assert_eq!(extract.output, None);
            }
            other => panic!("expected extract, got {:?}", other),
        }
    }

    #[test]
    fn it_should_accept_hash_algorithm_in_any_case() {
        let opts = Opts::from_iter(&["cfgdata-tool", "view", "blob.bin", "-a", "SHA384"]);

        match opts.command {
            Command::View(view) => assert_eq!(view.hash, HashAlgorithm::Sha384),
            other => panic!("expected view, got {:?}", other),
        }
    }

    #[test]
    fn it_should_reject_unknown_hash_algorithm() {
        assert_eq!("SHA384".parse::<HashAlgorithm>(), Ok(HashAlgorithm::Sha384));
        assert!("md5".parse::<HashAlgorithm>().is_err());
    }
}
