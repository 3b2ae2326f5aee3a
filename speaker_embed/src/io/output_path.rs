use std::path::{Path, PathBuf};

use crate::io::IoArgs;
use crate::io::batch_items::BatchItem;

/// Get the embedding output path for a batch item
pub fn get_output_path(io_args: &IoArgs, item: &BatchItem, is_batch_mode: bool) -> PathBuf {
    // If item specifies its own output, use that
    if let Some(ref output) = item.output {
        if let Some(ref dir) = io_args.output_dir {
            return dir.join(output);
        }
        return PathBuf::from(output);
    }

    // In batch mode, name the file after the audio
    if is_batch_mode {
        let dir = io_args
            .output_dir
            .as_deref()
            .unwrap_or_else(|| Path::new("."));
        return dir.join(format!("{}.json", item.label()));
    }

    // Single mode uses the --output argument
    io_args.output.clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_paths() {
        let io_args = IoArgs {
            output: PathBuf::from("embedding.json"),
            output_dir: Some(PathBuf::from("out")),
            ..Default::default()
        };
        let item = BatchItem::from_path("data/alice_01.wav");
        assert_eq!(
            get_output_path(&io_args, &item, true),
            PathBuf::from("out/alice_01.json")
        );
        assert_eq!(
            get_output_path(&io_args, &item, false),
            PathBuf::from("embedding.json")
        );

        let named = BatchItem {
            output: Some("custom.json".to_string()),
            ..item
        };
        assert_eq!(
            get_output_path(&io_args, &named, true),
            PathBuf::from("out/custom.json")
        );
    }
}
