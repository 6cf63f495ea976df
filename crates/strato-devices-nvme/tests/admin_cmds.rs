mod common;

use common::*;
use strato_devices_nvme::regs::{
    NVME_DNR, NVME_INVALID_CQID, NVME_INVALID_FIELD, NVME_INVALID_IRQ_VECTOR, NVME_INVALID_QID,
    NVME_INVALID_QUEUE_DEL, NVME_MAX_QSIZE_EXCEEDED,
};

#[test]
fn enable_from_cold_reports_ready() {
    let mut bench = Bench::new(2048);
    bench.enable();
    assert_eq!(bench.csts() & 0x1, 1, "CSTS.RDY after enable");

    // The admin pair is live: an invalid admin opcode gets a completion with
    // phase 1 and the advanced SQ head.
    let mut cmd = build_command(0xff);
    set_cid(&mut cmd, 0x11);
    let cqe = bench.submit_admin(cmd);
    assert_eq!(cqe.cid, 0x11);
    assert_eq!(cqe.phase(), 1);
    assert_eq!(cqe.sq_head, 1);
    assert_eq!(cqe.sqid, 0);
}

#[test]
fn create_delete_recreate_io_queues() {
    let mut bench = Bench::new(2048);
    bench.enable();
    bench.create_io_queues();

    // Delete SQ 1, then CQ 1.
    let mut cmd = build_command(0x00);
    set_cid(&mut cmd, 3);
    set_cdw10(&mut cmd, 1);
    let cqe = bench.submit_admin(cmd);
    assert_eq!(cqe.cid, 3);
    assert_eq!(cqe.code(), 0);

    let mut cmd = build_command(0x04);
    set_cid(&mut cmd, 4);
    set_cdw10(&mut cmd, 1);
    let cqe = bench.submit_admin(cmd);
    assert_eq!(cqe.code(), 0);

    // Same qids can be created again.
    bench.create_io_queues();
}

#[test]
fn create_sq_referencing_missing_cq_is_rejected() {
    let mut bench = Bench::new(2048);
    bench.enable();

    let mut cmd = build_command(0x01);
    set_cid(&mut cmd, 1);
    set_prp1(&mut cmd, IO_SQ);
    set_cdw10(&mut cmd, 15 << 16 | 1);
    set_cdw11(&mut cmd, 2 << 16 | 1); // CQID 2 does not exist
    let cqe = bench.submit_admin(cmd);
    assert_eq!(cqe.code(), NVME_INVALID_CQID | NVME_DNR);
}

#[test]
fn create_sq_validation_order_and_fields() {
    let mut bench = Bench::new(2048);
    bench.enable();
    bench.create_io_queues();

    // Duplicate qid.
    let mut cmd = build_command(0x01);
    set_cid(&mut cmd, 1);
    set_prp1(&mut cmd, IO_SQ);
    set_cdw10(&mut cmd, 15 << 16 | 1);
    set_cdw11(&mut cmd, 1 << 16 | 1);
    let cqe = bench.submit_admin(cmd);
    assert_eq!(cqe.code(), NVME_INVALID_QID | NVME_DNR);

    // Size above CAP.MQES (0x7ff zero-based).
    let mut cmd = build_command(0x01);
    set_cid(&mut cmd, 2);
    set_prp1(&mut cmd, IO_SQ);
    set_cdw10(&mut cmd, 0x800 << 16 | 2);
    set_cdw11(&mut cmd, 1 << 16 | 1);
    let cqe = bench.submit_admin(cmd);
    assert_eq!(cqe.code(), NVME_MAX_QSIZE_EXCEEDED | NVME_DNR);

    // Misaligned base address.
    let mut cmd = build_command(0x01);
    set_cid(&mut cmd, 3);
    set_prp1(&mut cmd, IO_SQ | 0x200);
    set_cdw10(&mut cmd, 15 << 16 | 2);
    set_cdw11(&mut cmd, 1 << 16 | 1);
    let cqe = bench.submit_admin(cmd);
    assert_eq!(cqe.code(), NVME_INVALID_FIELD | NVME_DNR);

    // Physically-contiguous flag is mandatory.
    let mut cmd = build_command(0x01);
    set_cid(&mut cmd, 4);
    set_prp1(&mut cmd, IO_SQ);
    set_cdw10(&mut cmd, 15 << 16 | 2);
    set_cdw11(&mut cmd, 1 << 16);
    let cqe = bench.submit_admin(cmd);
    assert_eq!(cqe.code(), NVME_INVALID_FIELD | NVME_DNR);
}

#[test]
fn create_cq_rejects_bad_vector_and_size() {
    let mut bench = Bench::new(2048);
    bench.enable();

    // Vector beyond the queue count (num_queues defaults to 64).
    let mut cmd = build_command(0x05);
    set_cid(&mut cmd, 1);
    set_prp1(&mut cmd, IO_CQ);
    set_cdw10(&mut cmd, 15 << 16 | 1);
    set_cdw11(&mut cmd, 65 << 16 | 0x3);
    let cqe = bench.submit_admin(cmd);
    assert_eq!(cqe.code(), NVME_INVALID_IRQ_VECTOR | NVME_DNR);

    // Zero size.
    let mut cmd = build_command(0x05);
    set_cid(&mut cmd, 2);
    set_prp1(&mut cmd, IO_CQ);
    set_cdw10(&mut cmd, 1);
    set_cdw11(&mut cmd, 0x3);
    let cqe = bench.submit_admin(cmd);
    assert_eq!(cqe.code(), NVME_MAX_QSIZE_EXCEEDED | NVME_DNR);

    // Null base.
    let mut cmd = build_command(0x05);
    set_cid(&mut cmd, 3);
    set_cdw10(&mut cmd, 15 << 16 | 1);
    set_cdw11(&mut cmd, 0x3);
    let cqe = bench.submit_admin(cmd);
    assert_eq!(cqe.code(), NVME_INVALID_FIELD | NVME_DNR);
}

#[test]
fn delete_cq_with_bound_sq_is_refused() {
    let mut bench = Bench::new(2048);
    bench.enable();
    bench.create_io_queues();

    let mut cmd = build_command(0x04);
    set_cid(&mut cmd, 1);
    set_cdw10(&mut cmd, 1);
    let cqe = bench.submit_admin(cmd);
    // Refused without DNR; retry after deleting the SQ is expected to work.
    assert_eq!(cqe.code(), NVME_INVALID_QUEUE_DEL);

    let mut cmd = build_command(0x00);
    set_cid(&mut cmd, 2);
    set_cdw10(&mut cmd, 1);
    let cqe = bench.submit_admin(cmd);
    assert_eq!(cqe.code(), 0);

    let mut cmd = build_command(0x04);
    set_cid(&mut cmd, 3);
    set_cdw10(&mut cmd, 1);
    let cqe = bench.submit_admin(cmd);
    assert_eq!(cqe.code(), 0);
}

#[test]
fn delete_of_nonexistent_queues_is_rejected() {
    let mut bench = Bench::new(2048);
    bench.enable();

    let mut cmd = build_command(0x00);
    set_cid(&mut cmd, 1);
    set_cdw10(&mut cmd, 7);
    let cqe = bench.submit_admin(cmd);
    assert_eq!(cqe.code(), NVME_INVALID_QID | NVME_DNR);

    let mut cmd = build_command(0x04);
    set_cid(&mut cmd, 2);
    set_cdw10(&mut cmd, 7);
    let cqe = bench.submit_admin(cmd);
    assert_eq!(cqe.code(), NVME_INVALID_CQID | NVME_DNR);

    // Queue 0 is never deletable.
    let mut cmd = build_command(0x00);
    set_cid(&mut cmd, 3);
    set_cdw10(&mut cmd, 0);
    let cqe = bench.submit_admin(cmd);
    assert_eq!(cqe.code(), NVME_INVALID_QID | NVME_DNR);
}
