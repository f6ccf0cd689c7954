use libfd_broker::client::connect;
use libfd_broker::storage::MemoryBackend;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

#[tokio::test]
async fn files_through_one_client_stay_independent() {
    let client = connect(MemoryBackend::new());

    {
        let mut file1 = client.create("file1".to_string()).await.unwrap();
        let mut file2 = client.create("file2".to_string()).await.unwrap();
        assert_eq!((file1.fd(), file2.fd()), (0, 1));
        file1.write_all(b"This is file1").await.unwrap();
        file2.write_all(b"This is file2").await.unwrap();
        file1.close().await.unwrap();
        file2.close().await.unwrap();
    }
    {
        let mut file1 = client.open("file1".to_string()).await.unwrap();
        let mut file2 = client.open("file2".to_string()).await.unwrap();
        let mut file3 = client.create("file3".to_string()).await.unwrap();
        file3.write_all(b"This is file3").await.unwrap();

        let mut buf1 = String::new();
        let mut buf2 = String::new();
        file1.read_to_string(&mut buf1).await.unwrap();
        file2.read_to_string(&mut buf2).await.unwrap();
        assert_eq!("This is file1", buf1);
        assert_eq!("This is file2", buf2);
    }
    {
        let mut file3 = client.open("file3".to_string()).await.unwrap();
        let mut buf = String::new();
        file3.read_to_string(&mut buf).await.unwrap();
        assert_eq!("This is file3", buf);
    }
}

#[tokio::test]
async fn shared_read_only_opens_of_one_file_coexist() {
    let client = connect(MemoryBackend::new());
    {
        let mut file = client.create("shared".to_string()).await.unwrap();
        file.write_all(b"same bytes").await.unwrap();
        file.close().await.unwrap();
    }

    let mut a = client.open("shared".to_string()).await.unwrap();
    let mut b = client.open("shared".to_string()).await.unwrap();
    let mut buf_a = String::new();
    let mut buf_b = String::new();
    a.read_to_string(&mut buf_a).await.unwrap();
    b.read_to_string(&mut buf_b).await.unwrap();
    assert_eq!(buf_a, buf_b);
    assert_eq!("same bytes", buf_a);
}
