use anyhow::Result;
use hittools::{de, ser};
use std::fs::File;
use std::io::{stdout, BufReader};
use std::path::Path;

#[derive(Debug, argh::FromArgs)]
/// dump a hit file or event shard as tab-separated values
pub struct CliArgs {
    /// input path (.hits or .evts.zst)
    #[argh(positional)]
    pub path: String,
}

fn main() -> Result<()> {
    let args: CliArgs = argh::from_env();

    let stdout = stdout();
    let mut wtr = csv::WriterBuilder::new()
        .has_headers(false)
        .delimiter(b'\t')
        .from_writer(stdout.lock());

    if args.path.ends_with(".evts.zst") {
        for event in de::open_shard(Path::new(&args.path))? {
            let event = event?;
            for hit in &event.hits {
                wtr.write_record(&[
                    event.trigger_time_ns.to_string(),
                    hit.module.to_string(),
                    hit.channel.to_string(),
                    hit.charge_long.to_string(),
                    hit.charge_short.to_string(),
                    hit.rel_time_ns.to_string(),
                    (hit.is_with_ac as u8).to_string(),
                ])?;
            }
        }
    } else {
        let hits = de::hits(BufReader::new(File::open(&args.path)?))?;
        ser::tsv(&mut wtr, &hits)?;
    }
    wtr.flush()?;
    Ok(())
}
