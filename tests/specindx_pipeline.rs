use approx::assert_relative_eq;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::tempdir;

use radfits::commands::{run_pipeline, InputImage, SpecIndexOptions};
use radfits::miriad::{MiriadError, Toolkit};

/// Records every task call and fakes the datasets the tasks would create
#[derive(Default)]
struct FakeMiriad {
    /// prthd output keyed by dataset file name
    headers: HashMap<String, String>,
    /// sigest value keyed by dataset file name
    rms: HashMap<String, f64>,
    calls: RefCell<Vec<(String, Vec<String>)>>,
    fail_task: Option<String>,
}

fn value<'a>(args: &'a [String], key: &str) -> Option<&'a str> {
    args.iter()
        .find_map(|a| a.strip_prefix(key).and_then(|rest| rest.strip_prefix('=')))
}

fn file_name(dataset: &str) -> String {
    Path::new(dataset)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

impl FakeMiriad {
    fn image(&mut self, name: &str, bmaj: f64, increment: f64, freq: Option<f64>, rms: f64) {
        let mut text = format!(
            "Beam Size:   {:.4E} by   {:.4E} arcsec.\nPosition ang:    15.00 degrees.\n\
             Type     Pixels  Coord Value  at  Pixel     Coord Incr   Units\n\
             RA---SIN    128  05:34:31.940      65.00  {:.4E}  arcsec\n\
             DEC--SIN    128 +22:00:52.06      65.00   {:.4E}  arcsec\n",
            bmaj,
            bmaj * 0.8,
            -increment,
            increment
        );
        if let Some(f) = freq {
            text.push_str(&format!("FREQ-LSR      1   {:.4E}       1.00   1.0000E-03  GHz\n", f));
        }
        self.headers.insert(name.to_string(), text);
        self.rms.insert(name.to_string(), rms);
    }

    fn tasks(&self) -> Vec<String> {
        self.calls.borrow().iter().map(|(t, _)| t.clone()).collect()
    }

    fn calls_to(&self, task: &str) -> Vec<Vec<String>> {
        self.calls
            .borrow()
            .iter()
            .filter(|(t, _)| t == task)
            .map(|(_, a)| a.clone())
            .collect()
    }
}

impl Toolkit for FakeMiriad {
    fn run(&self, task: &str, args: &[String], cwd: &Path) -> Result<String, MiriadError> {
        self.calls
            .borrow_mut()
            .push((task.to_string(), args.to_vec()));

        if self.fail_task.as_deref() == Some(task) {
            return Err(MiriadError::Failed {
                task: task.to_string(),
                status: "exit status: 1".to_string(),
                stderr: "### Fatal Error: simulated".to_string(),
            });
        }

        let dataset = value(args, "in").map(file_name).unwrap_or_default();
        match task {
            "prthd" => Ok(self.headers.get(&dataset).cloned().unwrap_or_default()),
            "sigest" => Ok(format!(
                "Estimated rms is  {:.4E}\n",
                self.rms.get(&dataset).copied().unwrap_or(1.0)
            )),
            "gethd" => Ok("0.0875\n".to_string()),
            "fits" if value(args, "op") == Some("xyout") => {
                fs::write(cwd.join(value(args, "out").unwrap_or("out.fits")), b"SIMPLE").unwrap();
                Ok(String::new())
            }
            _ => {
                if let Some(out) = value(args, "out") {
                    let dir = cwd.join(out);
                    fs::create_dir_all(&dir).unwrap();
                    fs::write(dir.join("image"), task.as_bytes()).unwrap();
                }
                Ok(String::new())
            }
        }
    }
}

/// MIRIAD datasets are directories with an `image` item
fn make_dataset(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    fs::create_dir_all(&path).unwrap();
    fs::write(path.join("image"), name.as_bytes()).unwrap();
    fs::write(path.join("header"), b"hdr").unwrap();
    path
}

#[test]
fn test_pipeline_matches_and_fits_three_images() {
    let dir = tempdir().unwrap();
    let a = make_dataset(dir.path(), "snr.1400.mir");
    let b = make_dataset(dir.path(), "snr.2100.mir");
    let c = make_dataset(dir.path(), "snr.5500.mir");

    let mut fake = FakeMiriad::default();
    fake.image("snr.1400.mir", 20.0, 4.0, Some(1.4), 1.0e-3);
    fake.image("snr.2100.mir", 60.0, 2.0, Some(2.1), 5.0e-4);
    fake.image("snr.5500.mir", 10.0, 1.0, Some(5.5), 2.0e-4);

    let output = dir.path().join("alpha.mir");
    let summary_path = dir.path().join("summary.json");
    let options = SpecIndexOptions {
        inputs: vec![InputImage::new(&a), InputImage::new(&b), InputImage::new(&c)],
        output: Some(output.clone()),
        fits_out: Some(dir.path().join("alpha.fits")),
        summary: Some(summary_path.clone()),
        ..Default::default()
    };

    let summary = run_pipeline(&fake, &options).unwrap();
    assert_eq!(summary.reference_grid, 2);
    assert_eq!(summary.reference_beam, 1);
    assert_relative_eq!(summary.fit.s, 1.0e6 + 4.0e6 + 2.5e7, max_relative = 1e-9);

    // everything except the finest grid is regridded onto it
    let regrids = fake.calls_to("regrid");
    assert_eq!(regrids.len(), 2);
    for args in &regrids {
        assert_eq!(value(args, "tin"), Some(c.to_str().unwrap()));
        assert_eq!(value(args, "axes"), Some("1,2"));
    }

    // everything except the biggest beam is convolved to it, using its angle
    let convols = fake.calls_to("convol");
    assert_eq!(convols.len(), 2);
    for args in &convols {
        assert_eq!(value(args, "fwhm"), Some("6.000000e1,4.800000e1"));
        assert_eq!(value(args, "pa"), Some("1.500000e1"));
        assert_eq!(value(args, "options"), Some("final"));
    }
    assert_eq!(value(&convols[0], "map"), Some("in00.rg"));
    // image 1 is only regridded, image 2 only convolved
    assert_eq!(value(&convols[1], "map"), Some(c.to_str().unwrap()));

    let maths = fake.calls_to("maths");
    assert_eq!(maths.len(), 6);
    assert_eq!(value(&maths[0], "exp"), Some("log(<f00>)"));
    assert_eq!(value(&maths[0], "mask"), Some("<f00>.gt.0"));
    assert_eq!(value(&maths[3], "out"), Some("Sy"));
    assert_eq!(value(&maths[4], "out"), Some("Sxy"));
    assert!(value(&maths[3], "exp").unwrap().contains("<f02.log>"));

    let puthd: Vec<String> = fake
        .calls_to("puthd")
        .iter()
        .map(|args| args.join(" "))
        .collect();
    assert_eq!(
        puthd,
        vec![
            "in=specindx.mir/btype value=spectral_index",
            "in=specindx.mir/bunit value=SpectralIndex",
        ]
    );

    // inputs are never moved or modified
    assert_eq!(fs::read(a.join("image")).unwrap(), b"snr.1400.mir");
    assert_eq!(fs::read(c.join("image")).unwrap(), b"snr.5500.mir");

    assert!(output.join("image").exists());
    assert!(dir.path().join("alpha.fits").exists());
    let json: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&summary_path).unwrap()).unwrap();
    assert_eq!(json["images"].as_array().unwrap().len(), 3);
    assert_eq!(json["reference_beam"], 1);

    // the working directory is cleaned up
    let leftovers: Vec<_> = fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|n| n.starts_with(".specindx"))
        .collect();
    assert!(leftovers.is_empty(), "left behind: {:?}", leftovers);
}

#[test]
fn test_fits_inputs_are_imported_and_labelled() {
    let dir = tempdir().unwrap();
    let gleam = dir.path().join("gleam_cutout_072-103MHz_133_-46333_STACKED.fits");
    fs::write(&gleam, b"SIMPLE").unwrap();
    let askap = make_dataset(dir.path(), "snr-askap.mir");

    let mut fake = FakeMiriad::default();
    // the imported GLEAM image has no frequency axis: restfreq is used
    fake.image("in00.mir", 120.0, 30.0, None, 0.05);
    fake.image("snr-askap.mir", 12.0, 2.0, Some(0.888), 3.0e-4);

    let workdir = dir.path().join("work");
    let options = SpecIndexOptions {
        inputs: vec![InputImage::new(&gleam), InputImage::new(&askap)],
        output: Some(dir.path().join("out.mir")),
        workdir: Some(workdir.clone()),
        keep_intermediates: true,
        ..Default::default()
    };
    let summary = run_pipeline(&fake, &options).unwrap();

    let tasks = fake.tasks();
    assert_eq!(tasks[0], "fits");
    let import = &fake.calls_to("fits")[0];
    assert_eq!(value(import, "op"), Some("xyin"));
    assert_eq!(value(import, "out"), Some("in00.mir"));

    let labels: Vec<String> = fake
        .calls_to("puthd")
        .iter()
        .take(3)
        .map(|args| args.join(" "))
        .collect();
    assert_eq!(
        labels,
        vec![
            "in=in00.mir/bunit value=JY/BEAM",
            "in=in00.mir/btype value=intensity",
            "in=in00.mir/restfreq value=0.087500",
        ]
    );
    assert_eq!(fake.calls_to("gethd").len(), 1);
    assert_relative_eq!(summary.images[0].stats.freq_ghz, 0.0875);

    // kept on request
    assert!(workdir.join("f00.log").exists());
    assert!(workdir.join("f01").exists());
    assert!(askap.join("image").exists());
}

#[test]
fn test_frequency_override_skips_header_lookup() {
    let dir = tempdir().unwrap();
    let a = make_dataset(dir.path(), "a.mir");
    let b = make_dataset(dir.path(), "b.mir");

    let mut fake = FakeMiriad::default();
    fake.image("a.mir", 30.0, 5.0, None, 1.0e-3);
    fake.image("b.mir", 30.0, 5.0, None, 1.0e-3);

    let options = SpecIndexOptions {
        inputs: vec![
            InputImage {
                path: a,
                freq_ghz: Some(0.15),
            },
            InputImage {
                path: b,
                freq_ghz: Some(1.4),
            },
        ],
        output: Some(dir.path().join("out.mir")),
        ..Default::default()
    };
    let summary = run_pipeline(&fake, &options).unwrap();
    assert!(fake.calls_to("gethd").is_empty());
    assert_relative_eq!(summary.images[1].stats.freq_ghz, 1.4);
    // equal grids and beams: the first image is the reference for both
    assert_eq!(summary.reference_grid, 0);
    assert_eq!(summary.reference_beam, 0);
}

#[test]
fn test_pipeline_errors() {
    let dir = tempdir().unwrap();
    let a = make_dataset(dir.path(), "a.mir");
    let b = make_dataset(dir.path(), "b.mir");
    let mut fake = FakeMiriad::default();
    fake.image("a.mir", 30.0, 5.0, Some(1.4), 1.0e-3);
    fake.image("b.mir", 30.0, 5.0, Some(1.4), 1.0e-3);

    // one image
    let one = SpecIndexOptions {
        inputs: vec![InputImage::new(&a)],
        output: Some(dir.path().join("one.mir")),
        ..Default::default()
    };
    assert!(run_pipeline(&fake, &one).is_err());
    assert!(fake.tasks().is_empty());

    // same frequency twice: nothing to fit
    let same = SpecIndexOptions {
        inputs: vec![InputImage::new(&a), InputImage::new(&b)],
        output: Some(dir.path().join("same.mir")),
        ..Default::default()
    };
    let err = run_pipeline(&fake, &same).unwrap_err();
    assert!(format!("{:#}", err).contains("same frequency"));
    assert!(fake.calls_to("regrid").is_empty());

    // existing output without --overwrite
    make_dataset(dir.path(), "taken.mir");
    let taken = SpecIndexOptions {
        inputs: vec![InputImage::new(&a), InputImage::new(&b)],
        output: Some(dir.path().join("taken.mir")),
        ..Default::default()
    };
    assert!(run_pipeline(&fake, &taken).is_err());
}

#[test]
fn test_failing_task_stops_pipeline() {
    let dir = tempdir().unwrap();
    let a = make_dataset(dir.path(), "a.mir");
    let b = make_dataset(dir.path(), "b.mir");
    let mut fake = FakeMiriad {
        fail_task: Some("convol".to_string()),
        ..Default::default()
    };
    fake.image("a.mir", 30.0, 5.0, Some(0.2), 1.0e-3);
    fake.image("b.mir", 10.0, 2.0, Some(1.4), 1.0e-3);

    let output = dir.path().join("out.mir");
    let options = SpecIndexOptions {
        inputs: vec![InputImage::new(&a), InputImage::new(&b)],
        output: Some(output.clone()),
        ..Default::default()
    };
    let err = run_pipeline(&fake, &options).unwrap_err();
    assert!(format!("{:#}", err).contains("convol"));
    assert!(!output.exists());
    assert!(fake.calls_to("maths").is_empty());
}

#[test]
fn test_existing_files_in_workdir_are_never_removed() {
    let dir = tempdir().unwrap();
    let a = make_dataset(dir.path(), "a.mir");
    let b = make_dataset(dir.path(), "b.mir");
    let mut fake = FakeMiriad::default();
    fake.image("a.mir", 30.0, 5.0, Some(0.2), 1.0e-3);
    fake.image("b.mir", 10.0, 2.0, Some(1.4), 1.0e-3);

    // a shared directory already holding datasets with the scratch names
    let shared = dir.path().join("shared");
    let f00 = make_dataset(&shared, "f00");
    let sy = make_dataset(&shared, "Sy");
    let notes = shared.join("notes.txt");
    fs::write(&notes, b"keep me").unwrap();

    let output = dir.path().join("out.mir");
    let options = SpecIndexOptions {
        inputs: vec![InputImage::new(&a), InputImage::new(&b)],
        output: Some(output.clone()),
        workdir: Some(shared.clone()),
        ..Default::default()
    };
    let err = run_pipeline(&fake, &options).unwrap_err();
    assert!(format!("{:#}", err).contains("f00 already exists"));

    assert_eq!(fs::read(f00.join("image")).unwrap(), b"f00");
    assert_eq!(fs::read(sy.join("image")).unwrap(), b"Sy");
    assert_eq!(fs::read(&notes).unwrap(), b"keep me");
    assert!(fake.calls_to("maths").is_empty());
    assert!(!output.exists());

    // only Sy in the way: the run stops before writing it
    fs::remove_dir_all(&f00).unwrap();
    let fake_again = {
        let mut f = FakeMiriad::default();
        f.image("a.mir", 30.0, 5.0, Some(0.2), 1.0e-3);
        f.image("b.mir", 10.0, 2.0, Some(1.4), 1.0e-3);
        f
    };
    let err = run_pipeline(&fake_again, &options).unwrap_err();
    assert!(format!("{:#}", err).contains("Sy already exists"));
    assert_eq!(fs::read(sy.join("image")).unwrap(), b"Sy");
    assert_eq!(fs::read(&notes).unwrap(), b"keep me");

    // the intermediates this run did create are cleaned up
    let mut left: Vec<String> = fs::read_dir(&shared)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    left.sort();
    assert_eq!(left, vec!["Sy", "notes.txt"]);
}

#[test]
fn test_existing_summary_is_not_clobbered() {
    let dir = tempdir().unwrap();
    let a = make_dataset(dir.path(), "a.mir");
    let b = make_dataset(dir.path(), "b.mir");
    let mut fake = FakeMiriad::default();
    fake.image("a.mir", 30.0, 5.0, Some(0.2), 1.0e-3);
    fake.image("b.mir", 10.0, 2.0, Some(1.4), 1.0e-3);

    let summary_path = dir.path().join("summary.json");
    fs::write(&summary_path, b"{\"previous\": true}").unwrap();

    let mut options = SpecIndexOptions {
        inputs: vec![InputImage::new(&a), InputImage::new(&b)],
        output: Some(dir.path().join("out.mir")),
        summary: Some(summary_path.clone()),
        ..Default::default()
    };
    let err = run_pipeline(&fake, &options).unwrap_err();
    assert!(format!("{:#}", err).contains("summary.json"));
    assert!(fake.tasks().is_empty());
    assert_eq!(fs::read(&summary_path).unwrap(), b"{\"previous\": true}");

    options.overwrite = true;
    run_pipeline(&fake, &options).unwrap();
    let json: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&summary_path).unwrap()).unwrap();
    assert_eq!(json["images"].as_array().unwrap().len(), 2);
}
