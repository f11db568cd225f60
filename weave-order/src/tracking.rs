use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;
use weave_core::identity::{Actor, Role};
use weave_core::lock::{LockKey, Locker, PURCHASE_ORDER_LOCK_TTL};
use weave_core::orders::{
    Attachment, BulkPurchaseOrder, LogisticInfo, PurchaseOrder, PurchaseOrderStatus, RawMaterial,
    StageNote,
};
use weave_core::repository::{ChangeSet, OrderRepository, Precondition};
use weave_core::tracking::{
    BulkTrackingAction, OrderKind, PoTrackingAction, TrackingMetadata, TrackingRecord,
};
use weave_shared::ids;

use crate::error::{OrderError, OrderResult};
use crate::locking::with_lock;

/// A sample-order tracking action with its payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum PoTrackingCommand {
    UploadDesign { techpack_attachments: Vec<Attachment> },
    ApproveDesign,
    RejectDesign { reason: Option<String> },
    SkipDesign,
    UpdateRawMaterial { raw_materials: Vec<RawMaterial> },
    MarkMaking { note: Option<StageNote> },
    MarkMakingWithoutRawMaterial { note: Option<StageNote> },
    MarkSubmit { note: Option<StageNote> },
    MarkDelivering { logistic_info: LogisticInfo },
    ConfirmDelivered,
}

impl PoTrackingCommand {
    pub fn action(&self) -> PoTrackingAction {
        match self {
            PoTrackingCommand::UploadDesign { .. } => PoTrackingAction::UploadDesign,
            PoTrackingCommand::ApproveDesign => PoTrackingAction::ApproveDesign,
            PoTrackingCommand::RejectDesign { .. } => PoTrackingAction::RejectDesign,
            PoTrackingCommand::SkipDesign => PoTrackingAction::SkipDesign,
            PoTrackingCommand::UpdateRawMaterial { .. } => PoTrackingAction::UpdateRawMaterial,
            PoTrackingCommand::MarkMaking { .. } => PoTrackingAction::MarkMaking,
            PoTrackingCommand::MarkMakingWithoutRawMaterial { .. } => PoTrackingAction::MarkMakingWithoutRawMaterial,
            PoTrackingCommand::MarkSubmit { .. } => PoTrackingAction::MarkSubmit,
            PoTrackingCommand::MarkDelivering { .. } => PoTrackingAction::MarkDelivering,
            PoTrackingCommand::ConfirmDelivered => PoTrackingAction::ConfirmDelivered,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum BulkTrackingCommand {
    MarkFirstPaymentConfirmed,
    UpdateRawMaterial { raw_materials: Vec<RawMaterial> },
    UpdatePps { note: Option<StageNote> },
    UpdateProduction { note: Option<StageNote> },
    ConfirmQc { note: Option<StageNote> },
    RequestFinalPayment,
    MarkFinalPaymentConfirmed,
    MarkDelivering { logistic_info: LogisticInfo },
    ConfirmDelivered,
    MarkDelivered,
}

impl BulkTrackingCommand {
    pub fn action(&self) -> BulkTrackingAction {
        match self {
            BulkTrackingCommand::MarkFirstPaymentConfirmed => BulkTrackingAction::MarkFirstPaymentConfirmed,
            BulkTrackingCommand::UpdateRawMaterial { .. } => BulkTrackingAction::UpdateRawMaterial,
            BulkTrackingCommand::UpdatePps { .. } => BulkTrackingAction::UpdatePps,
            BulkTrackingCommand::UpdateProduction { .. } => BulkTrackingAction::UpdateProduction,
            BulkTrackingCommand::ConfirmQc { .. } => BulkTrackingAction::ConfirmQc,
            BulkTrackingCommand::RequestFinalPayment => BulkTrackingAction::RequestFinalPayment,
            BulkTrackingCommand::MarkFinalPaymentConfirmed => BulkTrackingAction::MarkFinalPaymentConfirmed,
            BulkTrackingCommand::MarkDelivering { .. } => BulkTrackingAction::MarkDelivering,
            BulkTrackingCommand::ConfirmDelivered => BulkTrackingAction::ConfirmDelivered,
            BulkTrackingCommand::MarkDelivered => BulkTrackingAction::MarkDelivered,
        }
    }
}

fn with_reference_ids(raw_materials: Vec<RawMaterial>) -> OrderResult<Vec<RawMaterial>> {
    if raw_materials.is_empty() {
        return Err(OrderError::OrderInvalid("raw materials are required".to_string()));
    }
    Ok(raw_materials
        .into_iter()
        .map(|mut m| {
            if m.reference_id.is_none() {
                m.reference_id = Some(ids::raw_material_reference_id());
            }
            m
        })
        .collect())
}

pub struct TrackingService {
    repo: Arc<dyn OrderRepository>,
    locker: Arc<dyn Locker>,
}

impl TrackingService {
    pub fn new(repo: Arc<dyn OrderRepository>, locker: Arc<dyn Locker>) -> Self {
        Self { repo, locker }
    }

    pub async fn apply_to_purchase_order(
        &self,
        purchase_order_id: Uuid,
        actor: &Actor,
        command: PoTrackingCommand,
    ) -> OrderResult<PurchaseOrder> {
        let action = command.action();
        if !action.allowed_for(actor) {
            return Err(OrderError::Forbidden(action.as_str().to_string()));
        }

        with_lock(
            self.locker.as_ref(),
            LockKey::purchase_order(purchase_order_id),
            PURCHASE_ORDER_LOCK_TTL,
            || self.apply_po_locked(purchase_order_id, actor, command),
        )
        .await
    }

    async fn apply_po_locked(
        &self,
        purchase_order_id: Uuid,
        actor: &Actor,
        command: PoTrackingCommand,
    ) -> OrderResult<PurchaseOrder> {
        let mut po = self
            .repo
            .get_purchase_order(purchase_order_id)
            .await?
            .filter(|po| !po.is_archived())
            .filter(|po| actor.role != Role::Buyer || po.user_id == actor.user_id)
            .ok_or(OrderError::PurchaseOrderNotFound(purchase_order_id))?;

        let action = command.action();
        let from = po.tracking_status;
        let next = match action {
            // Orders paid without an inquiry skip production tracking.
            PoTrackingAction::MarkDelivering
                if po.status == PurchaseOrderStatus::Paid && po.inquiry_id.is_none() =>
            {
                Some(weave_core::tracking::PoTrackingStatus::Delivering)
            }
            PoTrackingAction::MarkMakingWithoutRawMaterial if !po.raw_materials.is_empty() => None,
            _ => action.next_status(from),
        }
        .ok_or_else(|| OrderError::invalid_transition(action.as_str(), from))?;

        let now = Utc::now();
        let mut before = json!({
            "tracking_status": po.tracking_status,
            "seller_tracking_status": po.seller_tracking_status,
        });
        let mut after = json!({});

        match command {
            PoTrackingCommand::UploadDesign { techpack_attachments } => {
                if techpack_attachments.is_empty() {
                    return Err(OrderError::OrderInvalid("design attachments are required".to_string()));
                }
                before["techpack_attachments"] = json!(po.techpack_attachments);
                after["techpack_attachments"] = json!(techpack_attachments);
                po.techpack_attachments = techpack_attachments;
            }
            PoTrackingCommand::ApproveDesign => {
                po.approve_design_at = Some(now);
            }
            PoTrackingCommand::RejectDesign { reason } => {
                before["techpack_attachments"] = json!(po.techpack_attachments);
                after["reason"] = json!(reason);
                po.techpack_attachments.clear();
            }
            PoTrackingCommand::SkipDesign | PoTrackingCommand::ConfirmDelivered => {}
            PoTrackingCommand::UpdateRawMaterial { raw_materials } => {
                let raw_materials = with_reference_ids(raw_materials)?;
                before["raw_materials"] = json!(po.raw_materials);
                after["raw_materials"] = json!(raw_materials);
                po.raw_materials = raw_materials;
            }
            PoTrackingCommand::MarkMaking { note } | PoTrackingCommand::MarkMakingWithoutRawMaterial { note } => {
                after["making_info"] = json!(note);
                po.making_info = note;
            }
            PoTrackingCommand::MarkSubmit { note } => {
                after["submit_info"] = json!(note);
                po.submit_info = note;
            }
            PoTrackingCommand::MarkDelivering { logistic_info } => {
                after["logistic_info"] = json!(logistic_info);
                po.logistic_info = Some(logistic_info);
                po.delivery_started_at = Some(now);
            }
        }
        if action == PoTrackingAction::ConfirmDelivered {
            po.receiver_confirmed_at = Some(now);
        }

        po.tracking_status = next;
        if let Some(seller_status) = action.seller_status() {
            po.seller_tracking_status = seller_status;
        }
        po.touch(now);
        after["tracking_status"] = json!(po.tracking_status);
        after["seller_tracking_status"] = json!(po.seller_tracking_status);

        let mut changes = ChangeSet::new();
        changes.tracking_records.push(TrackingRecord::new(
            OrderKind::PurchaseOrder,
            po.id,
            action.as_str(),
            po.user_id,
            actor.user_id,
            TrackingMetadata { before, after },
        ));
        changes.preconditions.push(Precondition::PurchaseOrderStatus { id: po.id, status: po.status });
        changes.purchase_orders.push(po.clone());
        self.repo.commit(changes).await?;

        info!(
            purchase_order_id = %po.id,
            action = action.as_str(),
            actor = %actor.user_id,
            "Purchase order tracking updated"
        );
        Ok(po)
    }

    pub async fn apply_to_bulk_order(
        &self,
        bulk_purchase_order_id: Uuid,
        actor: &Actor,
        command: BulkTrackingCommand,
    ) -> OrderResult<BulkPurchaseOrder> {
        let action = command.action();
        if !action.allowed_for(actor) {
            return Err(OrderError::Forbidden(action.as_str().to_string()));
        }

        let mut bulk = self
            .repo
            .get_bulk_order(bulk_purchase_order_id)
            .await?
            .filter(|b| actor.role != Role::Buyer || b.user_id == actor.user_id)
            .ok_or(OrderError::BulkOrderNotFound(bulk_purchase_order_id))?;

        let from = bulk.tracking_status;
        let next = action
            .next_status(from)
            .ok_or_else(|| OrderError::invalid_transition(action.as_str(), from))?;

        let now = Utc::now();
        let before = json!({ "tracking_status": bulk.tracking_status });
        let mut after = json!({});

        match command {
            BulkTrackingCommand::MarkFirstPaymentConfirmed => {
                bulk.first_payment.mark_as_paid_at.get_or_insert(now);
                bulk.apply_lead_time(now);
            }
            BulkTrackingCommand::MarkFinalPaymentConfirmed => {
                bulk.final_payment.mark_as_paid_at.get_or_insert(now);
            }
            BulkTrackingCommand::UpdateRawMaterial { raw_materials } => {
                let raw_materials = with_reference_ids(raw_materials)?;
                after["raw_materials"] = json!(raw_materials);
                bulk.raw_materials = raw_materials;
            }
            BulkTrackingCommand::UpdatePps { note }
            | BulkTrackingCommand::UpdateProduction { note }
            | BulkTrackingCommand::ConfirmQc { note } => {
                after["note"] = json!(note);
            }
            BulkTrackingCommand::MarkDelivering { logistic_info } => {
                after["logistic_info"] = json!(logistic_info);
                bulk.logistic_info = Some(logistic_info);
                bulk.delivery_started_at = Some(now);
            }
            BulkTrackingCommand::ConfirmDelivered => {
                bulk.receiver_confirmed_at = Some(now);
            }
            BulkTrackingCommand::RequestFinalPayment | BulkTrackingCommand::MarkDelivered => {}
        }

        bulk.tracking_status = next;
        bulk.touch(now);
        after["tracking_status"] = json!(bulk.tracking_status);

        let mut changes = ChangeSet::new();
        changes.tracking_records.push(TrackingRecord::new(
            OrderKind::BulkPurchaseOrder,
            bulk.id,
            action.as_str(),
            bulk.user_id,
            actor.user_id,
            TrackingMetadata { before, after },
        ));
        changes.preconditions.push(Precondition::BulkOrderStatus { id: bulk.id, status: from });
        changes.bulk_orders.push(bulk.clone());
        self.repo.commit(changes).await?;

        info!(
            bulk_purchase_order_id = %bulk.id,
            action = action.as_str(),
            actor = %actor.user_id,
            "Bulk purchase order tracking updated"
        );
        Ok(bulk)
    }

    pub async fn history(&self, kind: OrderKind, order_id: Uuid) -> OrderResult<Vec<TrackingRecord>> {
        let mut records = self.repo.list_tracking_records(kind, order_id).await?;
        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }
}
