mod common;

use common::{BUCKET, Harness};
use std::collections::HashMap;
use storage_dsm::{
    db::AccessRightsRepository,
    models::AccessRights,
    s3::ObjectStore,
    services::{DataManager, StorageError},
};

#[tokio::test]
async fn soft_links_need_an_existing_target_and_a_free_name() {
    let h = Harness::new().await;
    let (project, node) = h.project(1).await;
    let target = format!("{project}/{node}/data.csv");
    let link = format!("{project}/{node}/data_copy.csv");

    let err = h.dsm.create_soft_link(1, &target, &link).await.unwrap_err();
    assert!(matches!(err, StorageError::FileMetaDataNotFound { .. }));
    assert!(!h.dsm.files().exists(&link).await.unwrap());

    h.upload(1, &target, b"a,b,c").await;
    let created = h.dsm.create_soft_link(1, &target, &link).await.unwrap();
    assert!(created.is_soft_link);
    assert_eq!(created.object_name, target);

    let err = h.dsm.create_soft_link(1, &target, &link).await.unwrap_err();
    assert!(matches!(err, StorageError::LinkAlreadyExists { .. }));
}

#[tokio::test]
async fn project_deletion_without_rights_touches_nothing() {
    let h = Harness::new().await;
    let (project, node) = h.project(1).await;
    let file_id = format!("{project}/{node}/data.csv");
    h.upload(1, &file_id, b"payload").await;

    let err = h.dsm.delete_project(2, project, None).await.unwrap_err();
    assert!(matches!(err, StorageError::ProjectAccessRight { .. }));
    assert!(h.dsm.files().exists(&file_id).await.unwrap());
    assert!(h.object_exists(&file_id).await);

    h.dsm.delete_project(1, project, None).await.unwrap();
    assert!(!h.dsm.files().exists(&file_id).await.unwrap());
    assert!(!h.object_exists(&file_id).await);
}

#[tokio::test]
async fn owners_get_everything_and_others_the_union_of_their_groups() {
    let h = Harness::new().await;
    let (project, _) = h.project(1).await;
    h.share(
        project,
        r#"{"10": {"read": true, "write": false, "delete": false},
            "20": {"read": false, "write": true, "delete": false},
            "30": {"read": true, "write": true, "delete": true}}"#,
    )
    .await;
    h.join_group(1, 10).await;
    h.join_group(2, 10).await;
    h.join_group(2, 20).await;
    h.join_group(3, 99).await;

    let access = AccessRightsRepository::new(h.pool.clone());
    assert_eq!(
        access.get_project_access_rights(1, project).await.unwrap(),
        AccessRights::all()
    );
    assert_eq!(
        access.get_project_access_rights(2, project).await.unwrap(),
        AccessRights {
            read: true,
            write: true,
            delete: false,
        }
    );
    assert_eq!(
        access.get_project_access_rights(3, project).await.unwrap(),
        AccessRights::none()
    );
}

#[tokio::test]
async fn deleting_a_link_keeps_the_target_bytes() {
    let h = Harness::new().await;
    let (project, node) = h.project(1).await;
    let target = format!("{project}/{node}/data.csv");
    let link = format!("{project}/{node}/alias.csv");
    h.upload(1, &target, b"shared").await;
    h.dsm.create_soft_link(1, &target, &link).await.unwrap();

    h.dsm.delete_file(1, &link).await.unwrap();
    assert!(!h.dsm.files().exists(&link).await.unwrap());
    assert!(h.object_exists(&target).await);
    assert_eq!(h.dsm.get_file(1, &target).await.unwrap().file_size, 6);
}

#[tokio::test]
async fn deleting_a_linked_target_leaves_the_link_dangling() {
    let h = Harness::new().await;
    let (project, node) = h.project(1).await;
    let target = format!("{project}/{node}/data.csv");
    let link = format!("{project}/{node}/alias.csv");
    h.upload(1, &target, b"shared").await;
    h.dsm.create_soft_link(1, &target, &link).await.unwrap();

    // links are not reference counted: the bytes go with the target
    h.dsm.delete_file(1, &target).await.unwrap();
    assert!(!h.object_exists(&target).await);
    assert!(h.dsm.files().exists(&link).await.unwrap());
    let err = h
        .store
        .get_object_metadata(BUCKET, &target)
        .await
        .unwrap_err();
    assert!(err.is_not_found());

    // the catalog synchronisation is what removes such rows
    let removed = h.dsm.synchronise_meta_data_table(false).await.unwrap();
    assert_eq!(removed, vec![link.clone()]);
    assert!(!h.dsm.files().exists(&link).await.unwrap());
}

#[tokio::test]
async fn deep_copy_renames_nodes() {
    let h = Harness::new().await;
    let (src, src_node) = h.project(1).await;
    let (dst, dst_node) = h.project(1).await;
    h.upload(1, &format!("{src}/{src_node}/out/result.txt"), b"42").await;

    let report = h
        .dsm
        .deep_copy_project(1, src, dst, &HashMap::from([(src_node, dst_node)]))
        .await
        .unwrap();
    assert_eq!(report.copied.len(), 1);
    let copied = format!("{dst}/{dst_node}/out/result.txt");
    assert_eq!(report.copied[0].file_id, copied);
    assert_eq!(h.store.get_object_bytes(BUCKET, &copied).await.unwrap(), &b"42"[..]);
}
