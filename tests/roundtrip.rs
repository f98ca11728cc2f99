
//! Whole-file round trips: create a file on disk, mutate it,
//! close it, reopen it, and verify what comes back.

use std::path::PathBuf;

use hfa::prelude::*;

fn scratch_path(directory: &tempfile::TempDir, name: &str) -> PathBuf {
    directory.path().join(name)
}


#[test]
fn create_then_read_single_tiles() {
    let directory = tempfile::tempdir().unwrap();
    let path = scratch_path(&directory, "tiny.img");

    {
        let mut file = HfaFile::create_with_options(
            &path, 3, 2, 1, PixelType::U8,
            &CreateOptions { block_size: 2, ..CreateOptions::default() },
        ).unwrap();

        assert_eq!(file.band(0).unwrap().blocks_per_row, 2);
        assert_eq!(file.band(0).unwrap().blocks_per_column, 1);
        assert_eq!(file.band(0).unwrap().tile_byte_count(), 4);

        file.write_tile(0, 0, 0, &mut [ 1, 2, 3, 4 ]).unwrap();
        file.write_tile(0, 1, 0, &mut [ 5, 0, 0, 0 ]).unwrap();
        file.close().unwrap();
    }

    let mut file = HfaFile::open(&path, Access::ReadOnly).unwrap();
    assert_eq!(file.width(), 3);
    assert_eq!(file.height(), 2);
    assert_eq!(file.band_count(), 1);

    let mut pixels = [ 0_u8; 4 ];
    file.read_tile(0, 0, 0, &mut pixels).unwrap();
    assert_eq!(pixels, [ 1, 2, 3, 4 ]);

    file.read_tile(0, 1, 0, &mut pixels).unwrap();
    assert_eq!(pixels, [ 5, 0, 0, 0 ]);
}

#[test]
fn unwritten_valid_tiles_read_as_zero() {
    let directory = tempfile::tempdir().unwrap();
    let path = scratch_path(&directory, "holes.img");

    {
        let mut file = HfaFile::create(&path, 100, 100, 1, PixelType::U8).unwrap();
        file.write_tile(0, 0, 0, &mut vec![ 9_u8; 4096 ]).unwrap();
        file.close().unwrap();
    }

    let mut file = HfaFile::open(&path, Access::ReadOnly).unwrap();
    let mut pixels = vec![ 0xff_u8; 4096 ];

    file.read_tile(0, 0, 0, &mut pixels).unwrap();
    assert!(pixels.iter().all(|pixel| *pixel == 9));

    file.read_tile(0, 1, 1, &mut pixels).unwrap();
    assert!(pixels.iter().all(|pixel| *pixel == 0));
}

#[test]
fn compressed_tiles_round_trip() {
    let directory = tempfile::tempdir().unwrap();
    let path = scratch_path(&directory, "compressed.img");

    let mut uniform = vec![ 42_u8; 4096 ];
    let mut alternating: Vec<u8> = (0 .. 4096).map(|index| (index % 2) as u8).collect();

    {
        let mut file = HfaFile::create_with_options(
            &path, 128, 64, 1, PixelType::U8,
            &CreateOptions { compression: Compression::RunLength, ..CreateOptions::default() },
        ).unwrap();

        // compressible data stays compressed, incompressible data
        // silently falls back to raw storage
        file.write_tile(0, 0, 0, &mut uniform).unwrap();
        file.write_tile(0, 1, 0, &mut alternating).unwrap();
        file.close().unwrap();
    }

    let mut file = HfaFile::open(&path, Access::ReadOnly).unwrap();
    let mut pixels = vec![ 0_u8; 4096 ];

    file.read_tile(0, 0, 0, &mut pixels).unwrap();
    assert_eq!(pixels, uniform);

    file.read_tile(0, 1, 0, &mut pixels).unwrap();
    assert_eq!(pixels, alternating);
}

#[test]
fn compressed_tiles_start_invalid_and_read_as_zero() {
    let directory = tempfile::tempdir().unwrap();
    let path = scratch_path(&directory, "invalid.img");

    {
        let file = HfaFile::create_with_options(
            &path, 64, 64, 1, PixelType::U8,
            &CreateOptions { compression: Compression::RunLength, ..CreateOptions::default() },
        ).unwrap();

        file.close().unwrap();
    }

    for access in [ Access::ReadOnly, Access::Update ] {
        let mut file = HfaFile::open(&path, access).unwrap();
        let mut pixels = vec![ 0xff_u8; 4096 ];
        file.read_tile(0, 0, 0, &mut pixels).unwrap();
        assert!(pixels.iter().all(|pixel| *pixel == 0));
    }
}

#[test]
fn sixteen_bit_tiles_restore_bit_identical_pixels() {
    let directory = tempfile::tempdir().unwrap();
    let path = scratch_path(&directory, "deep.img");

    let values: Vec<u16> = (0 .. 4096_u32).map(|index| (index * 7 + 3) as u16).collect();
    let mut pixels = Vec::with_capacity(values.len() * 2);
    for value in &values { pixels.extend_from_slice(&value.to_ne_bytes()); }

    {
        let mut file = HfaFile::create(&path, 64, 64, 1, PixelType::U16).unwrap();
        file.write_tile(0, 0, 0, &mut pixels).unwrap();
        file.close().unwrap();
    }

    let mut file = HfaFile::open(&path, Access::ReadOnly).unwrap();
    let mut decoded = vec![ 0_u8; pixels.len() ];
    file.read_tile(0, 0, 0, &mut decoded).unwrap();
    assert_eq!(decoded, pixels);
}

#[test]
fn grow_a_counted_pointer_field() {
    let directory = tempfile::tempdir().unwrap();
    let path = scratch_path(&directory, "datum.img");

    {
        let mut file = HfaFile::create_empty(&path).unwrap();
        let root = file.root();

        let datum = file.create_node(root, "MyDatum", "Eprj_Datum").unwrap();
        file.make_data(datum, 96).unwrap();
        file.set_node_position(datum);

        file.set_double(datum, "params[3]", 1.5).unwrap();
        file.close().unwrap();
    }

    let mut file = HfaFile::open(&path, Access::ReadOnly).unwrap();
    let datum = file.named_node("MyDatum").unwrap().unwrap();

    assert_eq!(file.get_double(datum, "params[3]").unwrap(), 1.5);
    assert_eq!(file.field_count(datum, "params").unwrap(), 4);
}

#[test]
fn flush_and_reopen_projection_fields() {
    let directory = tempfile::tempdir().unwrap();
    let path = scratch_path(&directory, "projected.img");

    {
        let mut file = HfaFile::create(&path, 50, 40, 1, PixelType::U8).unwrap();
        let root = file.root();

        let projection = file.create_node(root, "Projection", "Eprj_ProParameters").unwrap();
        file.make_data(projection, 300).unwrap();
        file.set_node_position(projection);

        file.set_int(projection, "proNumber", 5).unwrap();
        file.set_string(projection, "proName", "Mercator").unwrap();
        file.close().unwrap();
    }

    let mut file = HfaFile::open(&path, Access::ReadOnly).unwrap();
    let root = file.root();

    assert_eq!(file.get_int(root, "Projection:proNumber").unwrap(), 5);
    assert_eq!(file.get_string(root, "Projection:proName").unwrap(), "Mercator");
}

#[test]
fn removed_nodes_stay_removed() {
    let directory = tempfile::tempdir().unwrap();
    let path = scratch_path(&directory, "pruned.img");

    {
        let mut file = HfaFile::create_empty(&path).unwrap();
        let root = file.root();

        for name in [ "first", "second", "third" ] {
            let node = file.create_node(root, name, "Ehfa_Data").unwrap();
            file.make_data(node, 8).unwrap();
        }

        file.close().unwrap();
    }

    {
        let mut file = HfaFile::open(&path, Access::Update).unwrap();
        let second = file.named_node("second").unwrap().unwrap();
        file.remove_node(second).unwrap();
        file.close().unwrap();
    }

    let mut file = HfaFile::open(&path, Access::ReadOnly).unwrap();
    assert!(file.named_node("first").unwrap().is_some());
    assert!(file.named_node("second").unwrap().is_none());
    assert!(file.named_node("third").unwrap().is_some());
}

#[test]
fn spilled_rasters_round_trip() {
    let directory = tempfile::tempdir().unwrap();
    let path = scratch_path(&directory, "spilled.img");

    {
        let mut file = HfaFile::create_with_options(
            &path, 100, 100, 2, PixelType::U8,
            &CreateOptions { use_spill: true, ..CreateOptions::default() },
        ).unwrap();

        assert_eq!(file.spill_filename(), Some("spilled.ige"));

        file.write_tile(0, 0, 0, &mut vec![ 1_u8; 4096 ]).unwrap();
        file.write_tile(1, 0, 0, &mut vec![ 2_u8; 4096 ]).unwrap();
        file.write_tile(1, 1, 1, &mut vec![ 3_u8; 4096 ]).unwrap();
        file.close().unwrap();
    }

    assert!(directory.path().join("spilled.ige").is_file());

    let mut file = HfaFile::open(&path, Access::ReadOnly).unwrap();
    let mut pixels = vec![ 0_u8; 4096 ];

    file.read_tile(0, 0, 0, &mut pixels).unwrap();
    assert!(pixels.iter().all(|pixel| *pixel == 1));

    file.read_tile(1, 0, 0, &mut pixels).unwrap();
    assert!(pixels.iter().all(|pixel| *pixel == 2));

    file.read_tile(1, 1, 1, &mut pixels).unwrap();
    assert!(pixels.iter().all(|pixel| *pixel == 3));

    // the two bands interleave their tiles in the spill file
    file.read_tile(0, 1, 1, &mut pixels).unwrap();
    assert!(pixels.iter().all(|pixel| *pixel == 0));
}

#[test]
fn delete_removes_the_spill_file() {
    let directory = tempfile::tempdir().unwrap();
    let path = scratch_path(&directory, "doomed.img");

    HfaFile::create_with_options(
        &path, 64, 64, 1, PixelType::U8,
        &CreateOptions { use_spill: true, ..CreateOptions::default() },
    ).unwrap().close().unwrap();

    assert!(directory.path().join("doomed.ige").is_file());

    HfaFile::delete(&path).unwrap();
    assert!(!path.exists());
    assert!(!directory.path().join("doomed.ige").exists());
}

#[test]
fn overviews_in_the_main_file() {
    let directory = tempfile::tempdir().unwrap();
    let path = scratch_path(&directory, "pyramid.img");

    {
        let mut file = HfaFile::create(&path, 100, 100, 1, PixelType::U8).unwrap();

        let overview = file.create_overview(0, 2, false).unwrap();
        assert_eq!(overview, 0);
        assert_eq!(file.overview_count(0).unwrap(), 1);

        {
            let band = file.overview(0, 0).unwrap();
            assert_eq!((band.width, band.height), (50, 50));
            assert_eq!((band.block_width, band.block_height), (64, 64));
            assert_eq!(band.pixel_type, PixelType::U8);
        }

        file.write_overview_tile(0, 0, 0, 0, &mut vec![ 8_u8; 4096 ]).unwrap();
        file.close().unwrap();
    }

    let mut file = HfaFile::open(&path, Access::ReadOnly).unwrap();
    assert_eq!(file.overview_count(0).unwrap(), 1);

    let mut pixels = vec![ 0_u8; 4096 ];
    file.read_overview_tile(0, 0, 0, 0, &mut pixels).unwrap();
    assert!(pixels.iter().all(|pixel| *pixel == 8));
}

#[test]
fn overviews_in_the_dependent_file() {
    let directory = tempfile::tempdir().unwrap();
    let path = scratch_path(&directory, "layered.img");

    {
        let mut file = HfaFile::create(&path, 64, 64, 1, PixelType::U8).unwrap();
        file.create_overview(0, 4, true).unwrap();
        file.write_overview_tile(0, 0, 0, 0, &mut vec![ 5_u8; 4096 ]).unwrap();
        file.close().unwrap();
    }

    assert!(directory.path().join("layered.rrd").is_file());

    {
        let mut dependent = HfaFile::open(directory.path().join("layered.rrd"), Access::ReadOnly).unwrap();
        let root = dependent.root();
        assert_eq!(
            dependent.get_string(root, "DependentFile:dependent.string").unwrap(),
            "layered.img"
        );
    }

    let mut file = HfaFile::open(&path, Access::ReadOnly).unwrap();
    assert_eq!(file.overview_count(0).unwrap(), 1);

    let mut pixels = vec![ 0_u8; 4096 ];
    file.read_overview_tile(0, 0, 0, 0, &mut pixels).unwrap();
    assert!(pixels.iter().all(|pixel| *pixel == 5));
}

#[test]
fn opening_foreign_files_fails_cleanly() {
    let directory = tempfile::tempdir().unwrap();
    let path = scratch_path(&directory, "not-an-image.img");

    std::fs::write(&path, b"GIF89a definitely not a raster container").unwrap();

    assert!(matches!(
        HfaFile::open(&path, Access::ReadOnly),
        Err(Error::MalformedDictionary(_))
    ));

    // the handle is released, so the file can be replaced immediately
    std::fs::write(&path, b"still not one").unwrap();
}

#[test]
fn band_names_can_change() {
    let directory = tempfile::tempdir().unwrap();
    let path = scratch_path(&directory, "named.img");

    {
        let mut file = HfaFile::create(&path, 10, 10, 2, PixelType::U8).unwrap();
        assert_eq!(file.band_name(0), Some("Layer_1"));
        assert_eq!(file.band_name(1), Some("Layer_2"));

        file.set_band_name(0, "elevation").unwrap();
        file.close().unwrap();
    }

    let file = HfaFile::open(&path, Access::ReadOnly).unwrap();
    assert_eq!(file.band_name(0), Some("elevation"));
    assert_eq!(file.band_name(1), Some("Layer_2"));
}

#[test]
fn layers_can_be_added_to_an_existing_file() {
    let directory = tempfile::tempdir().unwrap();
    let path = scratch_path(&directory, "grown.img");

    {
        let mut file = HfaFile::create(&path, 70, 70, 1, PixelType::U8).unwrap();
        let band = file.add_layer("infrared", 70, 70, PixelType::U16, Compression::Uncompressed, 64).unwrap();
        assert_eq!(band, 1);

        let mut pixels = vec![ 0_u8; 2 * 4096 ];
        pixels[0 .. 2].copy_from_slice(&777_u16.to_ne_bytes());
        file.write_tile(1, 0, 0, &mut pixels).unwrap();

        assert!(matches!(
            file.add_layer("too-big", 400, 400, PixelType::U8, Compression::Uncompressed, 64),
            Err(Error::NotSupported(_))
        ));

        file.close().unwrap();
    }

    let mut file = HfaFile::open(&path, Access::ReadOnly).unwrap();
    assert_eq!(file.band_count(), 2);
    assert_eq!(file.band_name(1), Some("infrared"));
    assert_eq!(file.band(1).unwrap().pixel_type, PixelType::U16);

    let mut pixels = vec![ 0_u8; 2 * 4096 ];
    file.read_tile(1, 0, 0, &mut pixels).unwrap();
    assert_eq!(&pixels[0 .. 2], &777_u16.to_ne_bytes());
}

#[test]
fn tile_indices_are_validated() {
    let directory = tempfile::tempdir().unwrap();
    let path = scratch_path(&directory, "bounds.img");

    let mut file = HfaFile::create(&path, 100, 100, 1, PixelType::U8).unwrap();
    let mut pixels = vec![ 0_u8; 4096 ];

    assert!(matches!(
        file.read_tile(0, 2, 0, &mut pixels),
        Err(Error::OutOfRange(_))
    ));

    assert!(matches!(
        file.read_tile(1, 0, 0, &mut pixels),
        Err(Error::OutOfRange(_))
    ));

    assert!(matches!(
        file.read_tile(0, 0, 0, &mut [ 0_u8; 16 ]),
        Err(Error::Truncated(_))
    ));
}
