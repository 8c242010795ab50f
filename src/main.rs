extern crate log;
extern crate pretty_env_logger;

use std::path::{Path, PathBuf};
use std::process::exit;

use clap::{arg, command, Command};

use crate::answer_key::AnswerKey;
use crate::processor::{OmrConfig, OmrProcessor};

mod answer_key;
mod bubble_detector;
mod debug;
mod error;
mod geometry;
mod image_processor;
mod image_utils;
mod processor;
mod score_calculator;
mod template_matcher;

fn main() {
    pretty_env_logger::init_custom_env("LOG");

    let matches = cli().get_matches();
    let debug = matches.get_flag("debug");
    let answer_key_path = matches
        .get_one::<String>("answer-key")
        .expect("answer key path is required");
    let output_dir = matches.get_one::<String>("output-dir").map(PathBuf::from);
    let student_ids: Option<Vec<String>> = matches.get_one::<String>("student-ids").map(|ids| {
        ids.split(',')
            .map(|id| id.trim().to_string())
            .collect::<Vec<String>>()
    });
    let image_paths: Vec<PathBuf> = matches
        .get_many::<String>("images")
        .expect("at least one sheet image is required")
        .map(PathBuf::from)
        .collect();

    let answer_key = match AnswerKey::load(Path::new(answer_key_path)) {
        Ok(key) => key,
        Err(e) => {
            eprintln!("Error loading answer key: {}", e);
            exit(1);
        }
    };

    if let Some(ids) = &student_ids {
        if ids.len() != image_paths.len() {
            eprintln!(
                "Error: {} student ids given for {} sheet images",
                ids.len(),
                image_paths.len()
            );
            exit(1);
        }
    }

    let config = OmrConfig {
        debug,
        ..OmrConfig::default()
    };
    let processor = OmrProcessor::new(config);

    if image_paths.len() == 1 {
        let student_id = student_ids
            .as_ref()
            .and_then(|ids| ids.first())
            .map(String::as_str);
        let report = processor.process_sheet(&image_paths[0], &answer_key, student_id);

        if let Some(dir) = &output_dir {
            if let Err(e) = processor.write_sheet_exports(&report, dir) {
                eprintln!("Error writing exports: {}", e);
                exit(1);
            }
        }

        println!(
            "{}",
            serde_json::to_string_pretty(&report).expect("sheet report serializes")
        );
        if !report.success() {
            exit(1);
        }
    } else {
        let summary = processor.process_batch(&image_paths, &answer_key, student_ids.as_deref());

        if let Some(dir) = &output_dir {
            if let Err(e) = processor.write_batch_exports(&summary, dir) {
                eprintln!("Error writing exports: {}", e);
                exit(1);
            }
        }

        println!(
            "{}",
            serde_json::to_string_pretty(&summary).expect("batch summary serializes")
        );
    }
}

fn cli() -> Command {
    command!()
        .arg(arg!(-k --"answer-key" <PATH> "Path to the answer key JSON file").required(true))
        .arg(arg!(-o --"output-dir" <DIR> "Directory for JSON/CSV result exports"))
        .arg(arg!(-s --"student-ids" <IDS> "Comma-separated student ids, one per sheet image"))
        .arg(arg!(-d --debug "Write intermediate debug images next to each sheet"))
        .arg(arg!(images: <SHEET_IMAGE> ... "Paths to OMR sheet images").required(true))
}
