//! Command-line surface.
//!
//! Each subcommand takes a `--`-delimited section list, the convention of
//! the outer pipeline driver that invokes these tools:
//!
//! ```text
//! tandemq parse   [modes] -- [name value]* -- [sam]+ -- [fasta]* -- prefix
//! tandemq rewrite [name value]* -- [sam] -- [pred]+ -- prefix
//! ```
//!
//! Invoked with no section arguments, a subcommand prints the option names
//! it recognizes, which the driver uses for pass-through discovery.

use crate::rewrite::RewriteConfig;
use crate::sim::SimFunction;
use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "tandemq",
    about = "Recalibrate SAM mapping qualities with tandem simulated reads",
    version
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Scan SAM input; emit feature rows, input-model templates, and
    /// simulated tandem reads
    Parse {
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Merge MAPQ predictions and rewrite a SAM file
    Rewrite {
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
}

/// Options for `tandemq parse`.
#[derive(Debug)]
pub struct ParseOpts {
    pub do_simulation: bool,
    pub do_input_model: bool,
    pub do_features: bool,
    pub wiggle: u64,
    pub input_model_size: usize,
    pub fraction_even: f64,
    pub low_score_bias: f64,
    pub max_allowed_fraglen: u64,
    pub sim_factor: f64,
    pub sim_function: SimFunction,
    pub sim_unp_min: u64,
    pub sim_conc_min: u64,
    pub sim_disc_min: u64,
    pub sim_bad_end_min: u64,
    pub seed: Option<u64>,
    pub quiet: bool,
    pub sams: Vec<PathBuf>,
    pub fastas: Vec<PathBuf>,
    pub prefix: PathBuf,
}

impl Default for ParseOpts {
    fn default() -> Self {
        ParseOpts {
            do_simulation: false,
            do_input_model: false,
            do_features: false,
            wiggle: 30,
            input_model_size: usize::MAX,
            fraction_even: 1.0,
            low_score_bias: 1.0,
            max_allowed_fraglen: 50_000,
            sim_factor: 30.0,
            sim_function: SimFunction::Sqrt,
            sim_unp_min: 30_000,
            sim_conc_min: 30_000,
            sim_disc_min: 10_000,
            sim_bad_end_min: 10_000,
            seed: None,
            quiet: false,
            sams: Vec::new(),
            fastas: Vec::new(),
            prefix: PathBuf::new(),
        }
    }
}

/// Option names `parse` accepts, for pass-through discovery.
pub const PARSE_OPTION_NAMES: &str = "wiggle input-model-size fraction-even low-score-bias \
     max-allowed-fraglen sim-factor sim-function sim-unp-min sim-conc-min sim-disc-min \
     sim-bad-end-min seed quiet";

/// Option names `rewrite` accepts.
pub const REWRITE_OPTION_NAMES: &str =
    "orig-mapq-flag precise-mapq-flag write-orig-mapq write-precise-mapq keep-ztz";

/// Split a raw argument list into its `--`-delimited sections.
fn split_sections(args: &[String]) -> Vec<Vec<&str>> {
    let mut sections: Vec<Vec<&str>> = vec![Vec::new()];
    for a in args {
        if a == "--" {
            sections.push(Vec::new());
        } else {
            sections.last_mut().expect("nonempty").push(a.as_str());
        }
    }
    sections
}

/// Iterate an options section as name/value pairs; an odd trailing name is
/// fatal.
fn option_pairs<'a>(section: &'a [&'a str]) -> Result<Vec<(&'a str, &'a str)>> {
    if section.len() % 2 != 0 {
        bail!("odd number of arguments in options section");
    }
    Ok(section.chunks(2).map(|c| (c[0], c[1])).collect())
}

fn parse_bool(value: &str) -> bool {
    value == "True" || value == "1"
}

pub fn parse_opts(args: &[String]) -> Result<ParseOpts> {
    let sections = split_sections(args);
    let mut opts = ParseOpts::default();

    // Section 0: mode letters, possibly concatenated ("sif").
    for token in &sections[0] {
        for c in token.chars() {
            match c {
                's' => opts.do_simulation = true,
                'i' => opts.do_input_model = true,
                'f' => opts.do_features = true,
                _ => tracing::warn!(mode = %c, "unrecognized mode letter"),
            }
        }
    }

    // Section 1: name/value option pairs.
    if let Some(section) = sections.get(1) {
        for (name, value) in option_pairs(section)? {
            match name {
                "wiggle" => opts.wiggle = value.parse()?,
                "input-model-size" => opts.input_model_size = value.parse()?,
                "fraction-even" => {
                    opts.fraction_even = value.parse()?;
                    if opts.fraction_even < 1.0 {
                        tracing::warn!("fraction-even is not currently implemented");
                    }
                }
                "low-score-bias" => {
                    opts.low_score_bias = value.parse()?;
                    if opts.low_score_bias < 1.0 {
                        tracing::warn!("low-score-bias is not currently implemented");
                    }
                }
                "max-allowed-fraglen" => opts.max_allowed_fraglen = value.parse()?,
                "sim-factor" => opts.sim_factor = value.parse()?,
                "sim-function" => {
                    opts.sim_function = match value {
                        "sqrt" => SimFunction::Sqrt,
                        "linear" => SimFunction::Linear,
                        other => bail!("could not parse sim-function argument: {}", other),
                    }
                }
                "sim-unp-min" => opts.sim_unp_min = value.parse()?,
                "sim-conc-min" => opts.sim_conc_min = value.parse()?,
                "sim-disc-min" => opts.sim_disc_min = value.parse()?,
                "sim-bad-end-min" => opts.sim_bad_end_min = value.parse()?,
                "seed" => opts.seed = Some(value.parse()?),
                "quiet" => opts.quiet = parse_bool(value),
                other => tracing::warn!(option = other, "unrecognized option"),
            }
        }
    }

    // Section 2: SAM inputs; section 3: FASTA inputs; section 4+: prefix.
    if let Some(section) = sections.get(2) {
        opts.sams = section.iter().map(PathBuf::from).collect();
    }
    if let Some(section) = sections.get(3) {
        opts.fastas = section.iter().map(PathBuf::from).collect();
    }
    let mut prefix_set = 0;
    for section in sections.iter().skip(4) {
        for p in section {
            opts.prefix = PathBuf::from(p);
            prefix_set += 1;
        }
    }
    if prefix_set > 1 {
        tracing::warn!(prefix = %opts.prefix.display(), "more than one output prefix; using the last");
    }

    if opts.sams.is_empty() || prefix_set == 0 {
        bail!(
            "usage: tandemq parse [modes] -- [name value]* -- [sam]+ -- [fasta]* -- prefix\n\
             modes: i (input-model templates), f (feature records), s (simulate reads)"
        );
    }
    if opts.do_simulation && opts.fastas.is_empty() {
        bail!("simulation requested (mode 's') but no FASTA inputs given");
    }
    Ok(opts)
}

/// Options for `tandemq rewrite`.
#[derive(Debug)]
pub struct RewriteOpts {
    pub config: RewriteConfig,
    pub quiet: bool,
    pub sam: PathBuf,
    pub preds: Vec<PathBuf>,
    pub prefix: PathBuf,
}

pub fn rewrite_opts(args: &[String]) -> Result<RewriteOpts> {
    let sections = split_sections(args);
    let mut config = RewriteConfig::default();
    let mut quiet = false;

    for (name, value) in option_pairs(&sections[0])? {
        match name {
            "orig-mapq-flag" => config.orig_mapq_flag = value.to_string(),
            "precise-mapq-flag" => config.precise_mapq_flag = value.to_string(),
            "write-orig-mapq" => config.write_orig_mapq = parse_bool(value),
            "write-precise-mapq" => config.write_precise_mapq = parse_bool(value),
            "keep-ztz" => config.keep_ztz = parse_bool(value),
            "quiet" => quiet = parse_bool(value),
            other => tracing::warn!(option = other, "unrecognized option"),
        }
    }

    let sams: Vec<PathBuf> = sections
        .get(1)
        .map(|s| s.iter().map(PathBuf::from).collect())
        .unwrap_or_default();
    let preds: Vec<PathBuf> = sections
        .get(2)
        .map(|s| s.iter().map(PathBuf::from).collect())
        .unwrap_or_default();
    let mut prefix: Option<PathBuf> = None;
    for section in sections.iter().skip(3) {
        for p in section {
            if prefix.is_some() {
                tracing::warn!(prefix = %p, "more than one output prefix; using the last");
            }
            prefix = Some(PathBuf::from(p));
        }
    }

    if sams.len() != 1 {
        bail!("rewrite takes exactly one SAM input, got {}", sams.len());
    }
    if preds.is_empty() {
        bail!("rewrite needs at least one prediction file");
    }
    let Some(prefix) = prefix else {
        bail!("usage: tandemq rewrite [name value]* -- [sam] -- [pred]+ -- prefix");
    };
    Ok(RewriteOpts {
        config,
        quiet,
        sam: sams.into_iter().next().expect("one sam"),
        preds,
        prefix,
    })
}
