use deltabak_fs::MemFile;
use deltabak_vhd::{create_dynamic, CreateOptions, DiskType, Footer, VhdFile, SECTOR_SIZE};
use proptest::prelude::*;

const BLOCK_SIZE: u32 = 4096;
const DISK_SECTORS: u64 = 64;
const DISK_SIZE: u64 = DISK_SECTORS * SECTOR_SIZE as u64;

#[derive(Debug, Clone)]
struct Write {
    sector: u64,
    data: Vec<u8>,
}

fn write_strategy() -> impl Strategy<Value = Write> {
    (0..DISK_SECTORS)
        .prop_flat_map(|sector| {
            let remaining = ((DISK_SECTORS - sector) * SECTOR_SIZE as u64) as usize;
            (
                Just(sector),
                prop::collection::vec(any::<u8>(), 1..=remaining.min(6 * SECTOR_SIZE)),
            )
        })
        .prop_map(|(sector, data)| Write { sector, data })
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap()
}

async fn empty_disk() -> VhdFile<MemFile> {
    let mut options = CreateOptions::new(DISK_SIZE);
    options.block_size = BLOCK_SIZE;
    options.timestamp = Some(0);
    create_dynamic(MemFile::detached(), options).await.unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 32,
        .. ProptestConfig::default()
    })]

    #[test]
    fn prop_write_data_matches_reference(writes in prop::collection::vec(write_strategy(), 1..16)) {
        let (actual, model) = runtime().block_on(async {
            let mut disk = empty_disk().await;
            let mut model = vec![0u8; DISK_SIZE as usize];
            for write in &writes {
                disk.write_data(write.sector, &write.data).await.unwrap();
                let start = write.sector as usize * SECTOR_SIZE;
                model[start..start + write.data.len()].copy_from_slice(&write.data);
            }

            let mut disk = VhdFile::open(disk.into_inner()).await.unwrap();
            let mut actual = vec![0u8; DISK_SIZE as usize];
            disk.read_at(0, &mut actual).await.unwrap();
            (actual, model)
        });
        prop_assert_eq!(actual, model);
    }

    #[test]
    fn prop_repeating_a_write_leaves_the_file_unchanged(writes in prop::collection::vec(write_strategy(), 1..8)) {
        let (before, after) = runtime().block_on(async {
            let mut disk = empty_disk().await;
            for write in &writes {
                disk.write_data(write.sector, &write.data).await.unwrap();
            }
            let file = disk.into_inner();
            let before = file.contents();

            let mut disk = VhdFile::open(file).await.unwrap();
            let last = writes.last().unwrap();
            disk.write_data(last.sector, &last.data).await.unwrap();
            (before, disk.into_inner().contents())
        });
        prop_assert!(before == after);
    }

    #[test]
    fn prop_footer_checksum_roundtrip(
        size_sectors in 1u64..1_000_000,
        uuid in any::<[u8; 16]>(),
        timestamp in any::<u32>(),
        saved_state in any::<u8>(),
        differencing in any::<bool>(),
    ) {
        let raw = runtime().block_on(async {
            let mut options = CreateOptions::new(size_sectors * SECTOR_SIZE as u64);
            options.uuid = Some(uuid);
            options.timestamp = Some(timestamp);
            let disk = create_dynamic(MemFile::detached(), options).await.unwrap();
            disk.into_inner().contents()
        });

        let mut footer = Footer::parse(raw[..SECTOR_SIZE].try_into().unwrap()).unwrap();
        prop_assert_eq!(footer.uuid, uuid);
        prop_assert_eq!(footer.timestamp, timestamp);

        footer.saved_state = saved_state;
        if differencing {
            footer.disk_type = DiskType::Differencing;
        }
        let encoded = footer.to_bytes();
        let parsed = Footer::parse(&encoded).unwrap();
        prop_assert_eq!(parsed.checksum, footer.compute_checksum());
        prop_assert_eq!(parsed, footer);
    }
}
