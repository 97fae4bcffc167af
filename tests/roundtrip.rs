//! End-to-end scenarios: create a file on an in-memory channel, close it,
//! reopen it, and read everything back.

use hdf5rw::channel::MemChannel;
use hdf5rw::datatype::Datatype;
use hdf5rw::error::Hdf5Error;
use hdf5rw::message::Dataspace;
use hdf5rw::value::DataCell;
use hdf5rw::{create, CreateOptions, Hdf5File};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn scalar_integer_dataset() {
    init_logging();
    let mut writer = create(MemChannel::new(), CreateOptions::default()).unwrap();
    let id = writer
        .create_dataset("temperature", Datatype::int64(), Dataspace::simple(vec![1]))
        .unwrap();
    writer
        .write_all(id, &[0x2A, 0, 0, 0, 0, 0, 0, 0])
        .unwrap();

    let eof = writer.allocator().end_of_file();
    assert!(eof >= 2056);
    assert_eq!(eof % 8, 0);
    writer.allocator().verify_disjoint().unwrap();

    let channel = writer.close().unwrap();
    let bytes = channel.into_bytes();
    assert_eq!(bytes.len() as u64, eof);

    let file = Hdf5File::from_bytes(bytes).unwrap();
    assert_eq!(file.superblock().end_of_file_address, eof);

    let dataset = file.dataset("temperature").unwrap();
    assert_eq!(dataset.dimensions, vec![1]);
    let cells = file.cells(dataset).unwrap();
    assert_eq!(cells, vec![DataCell::Signed(42)]);

    // The zero-copy fast path agrees.
    assert_eq!(file.view::<i64>("temperature").unwrap(), &[42]);
}

#[test]
fn twenty_datasets_grow_the_directory() {
    init_logging();
    let mut writer = create(MemChannel::new(), CreateOptions::default()).unwrap();

    for i in 1..=20u64 {
        let name = format!("dataset_{}", i);
        let id = writer
            .create_dataset(&name, Datatype::int64(), Dataspace::simple(vec![1]))
            .unwrap();
        writer.write_all(id, &i.to_le_bytes()).unwrap();

        // The name arena doubles while creating the 6th and 11th links.
        match i {
            5 => assert_eq!(writer.local_heap_capacity(), 88),
            6..=10 => assert_eq!(writer.local_heap_capacity(), 176),
            11 => assert_eq!(writer.local_heap_capacity(), 352),
            _ => {}
        }
        // A second symbol table node appears when the ninth entry splits
        // the first.
        if i == 8 {
            assert_eq!(writer.snod_count(), 1);
        }
        if i == 9 {
            assert_eq!(writer.snod_count(), 2);
        }
    }

    assert_eq!(writer.snod_count(), 4);
    assert_eq!(writer.local_heap_capacity(), 352);
    writer.allocator().verify_disjoint().unwrap();
    let eof = writer.allocator().end_of_file();
    assert_eq!(eof % 8, 0);

    let abandoned: Vec<_> = writer
        .allocator()
        .regions()
        .iter()
        .filter(|r| r.abandoned)
        .map(|r| (r.offset, r.size))
        .collect();
    // Two outgrown name arenas: the 88-byte prelude segment and the
    // 176-byte replacement.
    assert_eq!(abandoned.len(), 2);
    assert_eq!(abandoned[0], (712, 88));

    let bytes = writer.close().unwrap().into_bytes();
    let file = Hdf5File::from_bytes(bytes).unwrap();

    let names: Vec<&str> = file.root_group().children().map(|(name, _)| name).collect();
    let mut expected: Vec<String> = (1..=20).map(|i| format!("dataset_{}", i)).collect();
    expected.sort();
    assert_eq!(names, expected);

    for i in 1..=20u64 {
        let dataset = file.dataset(&format!("dataset_{}", i)).unwrap();
        assert_eq!(
            file.cells(dataset).unwrap(),
            vec![DataCell::Signed(i as i64)]
        );
    }
}

#[test]
fn compound_dataset_with_variable_length_member() {
    init_logging();
    let mut writer = create(MemChannel::new(), CreateOptions::default()).unwrap();
    let sizes = writer.sizes();

    // Fourteen members, one of them a variable-length string.
    let mut members: Vec<(String, Datatype)> = (0..11)
        .map(|i| (format!("field_{:02}", i), Datatype::int32()))
        .collect();
    members.push(("label".to_string(), Datatype::vlen_string(sizes)));
    members.push(("weight".to_string(), Datatype::float64()));
    members.push(("flag".to_string(), Datatype::fixed(1, false)));
    let compound = Datatype::compound(members);

    let id = writer
        .create_dataset("CompoundData", compound.clone(), Dataspace::simple(vec![3]))
        .unwrap();

    let rows: Vec<DataCell> = (0..3)
        .map(|row| {
            let mut cells: Vec<(String, DataCell)> = (0..11)
                .map(|i| (format!("field_{:02}", i), DataCell::Signed(row * 100 + i)))
                .collect();
            cells.push((
                "label".to_string(),
                DataCell::Str(format!("row number {}", row)),
            ));
            cells.push(("weight".to_string(), DataCell::Float64(row as f64 * 0.5)));
            cells.push(("flag".to_string(), DataCell::Unsigned(row as u64 & 1)));
            DataCell::Compound(cells)
        })
        .collect();
    writer.write_cells(id, &rows).unwrap();

    // The 14-member datatype message outgrows the header slot, so exactly
    // one continuation exists, and the labels landed in a global heap
    // collection.
    let continuations = writer
        .allocator()
        .regions()
        .iter()
        .filter(|r| r.tag == "continuation:CompoundData")
        .count();
    assert_eq!(writer.allocator().global_heap_sizes(), vec![4096]);
    writer.allocator().verify_disjoint().unwrap();

    let bytes = writer.close().unwrap().into_bytes();
    assert_eq!(continuations, 1);

    let file = Hdf5File::from_bytes(bytes).unwrap();
    let dataset = file.dataset("CompoundData").unwrap();
    assert_eq!(dataset.datatype, compound);

    let cells = file.cells(dataset).unwrap();
    assert_eq!(cells.len(), 3);
    match &cells[2] {
        DataCell::Compound(members) => {
            assert_eq!(members[0].1, DataCell::Signed(200));
            assert_eq!(members[11].1, DataCell::Str("row number 2".to_string()));
            assert_eq!(members[12].1, DataCell::Float64(1.0));
        }
        other => panic!("expected compound cell, got {:?}", other),
    }
}

#[test]
fn attributes_survive_a_roundtrip() {
    init_logging();
    let mut writer = create(MemChannel::new(), CreateOptions::default()).unwrap();
    let id = writer
        .create_dataset("with_attrs", Datatype::float64(), Dataspace::simple(vec![4]))
        .unwrap();
    writer
        .write_each(id, (0..4).map(|i| (i as f64).to_le_bytes().to_vec()))
        .unwrap();
    writer
        .create_attribute(
            id,
            "scale",
            Datatype::float64(),
            Dataspace::scalar(),
            &2.5f64.to_le_bytes(),
        )
        .unwrap();
    writer
        .create_attribute(
            id,
            "unit",
            Datatype::ascii(8),
            Dataspace::scalar(),
            b"kelvin\0\0",
        )
        .unwrap();

    let bytes = writer.close().unwrap().into_bytes();
    let file = Hdf5File::from_bytes(bytes).unwrap();
    let dataset = file.dataset("with_attrs").unwrap();

    assert_eq!(file.view::<f64>("with_attrs").unwrap(), &[0.0, 1.0, 2.0, 3.0]);

    let scale = &dataset.attributes()["scale"];
    assert_eq!(
        file.attribute_cells(scale).unwrap(),
        vec![DataCell::Float64(2.5)]
    );
    let unit = &dataset.attributes()["unit"];
    assert_eq!(
        file.attribute_cells(unit).unwrap(),
        vec![DataCell::Str("kelvin".to_string())]
    );
}

#[test]
fn many_attributes_grow_the_header() {
    init_logging();
    let mut writer = create(MemChannel::new(), CreateOptions::default()).unwrap();
    let id = writer
        .create_dataset("a", Datatype::int64(), Dataspace::scalar())
        .unwrap();
    let _pin = writer
        .create_dataset("b", Datatype::int64(), Dataspace::scalar())
        .unwrap();

    for i in 0..6 {
        writer
            .create_attribute(
                id,
                &format!("attribute_{}", i),
                Datatype::int64(),
                Dataspace::scalar(),
                &(i as i64).to_le_bytes(),
            )
            .unwrap();
    }

    // "a" sat pinned between the prelude and "b": its grown header moved
    // and the old slot stays reserved.
    let abandoned = writer
        .allocator()
        .regions()
        .iter()
        .any(|r| r.tag == "header:a" && r.abandoned);
    assert!(abandoned);
    writer.allocator().verify_disjoint().unwrap();

    let bytes = writer.close().unwrap().into_bytes();
    let file = Hdf5File::from_bytes(bytes).unwrap();
    let dataset = file.dataset("a").unwrap();
    assert_eq!(dataset.attributes().len(), 6);
    let attr = &dataset.attributes()["attribute_4"];
    assert_eq!(
        file.attribute_cells(attr).unwrap(),
        vec![DataCell::Signed(4)]
    );
}

#[test]
fn narrow_offset_sizes_roundtrip() {
    init_logging();
    let options = CreateOptions {
        offset_size: 4,
        length_size: 4,
        ..CreateOptions::default()
    };
    let mut writer = create(MemChannel::new(), options).unwrap();
    let id = writer
        .create_dataset("narrow", Datatype::int32(), Dataspace::simple(vec![2]))
        .unwrap();
    writer
        .write_all(id, &[1, 0, 0, 0, 2, 0, 0, 0])
        .unwrap();

    let bytes = writer.close().unwrap().into_bytes();
    let file = Hdf5File::from_bytes(bytes).unwrap();
    assert_eq!(file.superblock().offset_size, 4);
    let dataset = file.dataset("narrow").unwrap();
    assert_eq!(
        file.cells(dataset).unwrap(),
        vec![DataCell::Signed(1), DataCell::Signed(2)]
    );
}

#[test]
fn bad_signature_is_rejected() {
    init_logging();
    // Last signature byte is 0x0B instead of 0x0A.
    let bytes = vec![
        0x89, 0x48, 0x44, 0x46, 0x0D, 0x0A, 0x1A, 0x0B, 0, 0, 0, 0, 0, 8, 8, 0,
    ];
    match Hdf5File::from_bytes(bytes) {
        Err(Hdf5Error::BadSignature) => {}
        other => panic!("expected BadSignature, got {:?}", other),
    }
}

#[test]
fn failed_write_poisons_the_handle() {
    init_logging();
    let mut writer = create(MemChannel::new(), CreateOptions::default()).unwrap();
    let id = writer
        .create_dataset("once", Datatype::int64(), Dataspace::scalar())
        .unwrap();
    writer.write_all(id, &[0; 8]).unwrap();
    // Double write fails and poisons the handle.
    assert!(writer.write_all(id, &[0; 8]).is_err());
    match writer.create_dataset("more", Datatype::int64(), Dataspace::scalar()) {
        Err(Hdf5Error::HandlePoisoned) => {}
        other => panic!("expected HandlePoisoned, got {:?}", other),
    }
}

#[test]
fn closed_handle_refuses_work() {
    init_logging();
    let mut writer = create(MemChannel::new(), CreateOptions::default()).unwrap();
    writer.flush().unwrap();
    match writer.create_dataset("late", Datatype::int64(), Dataspace::scalar()) {
        Err(Hdf5Error::CacheMissOnClosedHandle) => {}
        other => panic!("expected CacheMissOnClosedHandle, got {:?}", other),
    }
}
